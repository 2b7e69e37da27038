//! Turns inserted message nodes into chat events.
//!
//! Message rows carry a persistent `data-id` of the form
//! `{fromMe}_{contact}@{server}_{messageId}`, e.g.
//! `false_79991234567@c.us_3EB0C4A1`. Each id yields at most one message;
//! the most recent `SEEN_CAPACITY` ids are remembered.

use super::dom::{DomNode, MutationRecord};
use crate::protocol::RelayError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::OnceLock;

pub const MESSAGE_ID_ATTR: &str = "data-id";
const TEXT_CLASS: &str = "selectable-text";
const MEDIA_TAGS: [&str; 2] = ["img", "video"];
const DOCUMENT_ICON: &str = "document";
const SEEN_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub contact_id: String,
    pub text: String,
    pub direction: Direction,
    pub has_media: bool,
    pub has_document: bool,
    pub observed_at: DateTime<Utc>,
}

fn message_id_regex() -> &'static Regex {
    static MESSAGE_ID_RE: OnceLock<Regex> = OnceLock::new();
    MESSAGE_ID_RE.get_or_init(|| {
        Regex::new(r"^(true|false)_([^_@]+)@([a-z.]+)_(.+)$").expect("message id regex must compile")
    })
}

#[derive(Debug)]
pub struct MessageExtractor {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for MessageExtractor {
    fn default() -> Self {
        Self::with_capacity(SEEN_CAPACITY)
    }
}

impl MessageExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember at most `capacity` ids; the oldest is forgotten first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn seen(&self) -> usize {
        self.seen.len()
    }

    fn remember(&mut self, id: &str) {
        if !self.seen.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    /// Parse one message row. Only a successful parse marks the id as seen:
    /// a row whose content renders after its id is picked up on a later
    /// mutation.
    pub fn extract(
        &mut self,
        node: &DomNode,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<ChatMessage>, RelayError> {
        let Some(id) = node.attr(MESSAGE_ID_ATTR) else {
            return Ok(None);
        };
        if self.seen.contains(id) {
            return Ok(None);
        }

        let captures = message_id_regex()
            .captures(id)
            .ok_or_else(|| RelayError::ExtractionFailure(format!("unrecognized message id `{id}`")))?;
        let direction = if &captures[1] == "true" {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        let contact_id = captures[2].to_string();

        let text = node
            .find(&|n| n.has_class(TEXT_CLASS))
            .map(DomNode::text_content)
            .unwrap_or_default()
            .trim()
            .to_string();
        let has_media = node
            .find(&|n| MEDIA_TAGS.contains(&n.tag.as_str()))
            .is_some();
        let has_document = node
            .find(&|n| n.attr("data-icon") == Some(DOCUMENT_ICON))
            .is_some();

        if text.is_empty() && !has_media && !has_document {
            return Err(RelayError::ExtractionFailure(format!(
                "message `{id}` has no content"
            )));
        }

        self.remember(id);
        Ok(Some(ChatMessage {
            id: id.to_string(),
            contact_id,
            text,
            direction,
            has_media,
            has_document,
            observed_at,
        }))
    }

    /// Every new message in a mutation batch, in document order. Nodes that
    /// fail to parse are logged and skipped.
    pub fn process(&mut self, record: &MutationRecord, observed_at: DateTime<Utc>) -> Vec<ChatMessage> {
        let mut rows = Vec::new();
        for node in &record.added {
            node.find_all(&|n| n.attr(MESSAGE_ID_ATTR).is_some(), &mut rows);
        }

        let mut messages = Vec::new();
        for row in rows {
            match self.extract(row, observed_at) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e) => tracing::debug!(target = %record.target, "Skipping message node: {e}"),
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, text: &str) -> DomNode {
        DomNode::new("div").with_attr(MESSAGE_ID_ATTR, id).with_child(
            DomNode::new("span")
                .with_class(TEXT_CLASS)
                .with_text(text),
        )
    }

    fn batch(nodes: Vec<DomNode>) -> MutationRecord {
        MutationRecord {
            target: "message-list".into(),
            added: nodes,
        }
    }

    #[test]
    fn parses_inbound_text_message() {
        let mut extractor = MessageExtractor::new();
        let now = Utc::now();
        let message = extractor
            .extract(&row("false_79991234567@c.us_3EB0AA", " Добрый день "), now)
            .unwrap()
            .unwrap();
        assert_eq!(message.contact_id, "79991234567");
        assert_eq!(message.direction, Direction::Inbound);
        assert_eq!(message.text, "Добрый день");
        assert!(!message.has_media);
        assert_eq!(message.observed_at, now);
    }

    #[test]
    fn same_node_is_parsed_once() {
        let mut extractor = MessageExtractor::new();
        let node = row("true_79991234567@c.us_X1", "sent by us");
        assert!(extractor.extract(&node, Utc::now()).unwrap().is_some());
        assert!(extractor.extract(&node, Utc::now()).unwrap().is_none());
        assert_eq!(extractor.seen(), 1);
    }

    #[test]
    fn media_and_document_flags() {
        let mut extractor = MessageExtractor::new();
        let node = DomNode::new("div")
            .with_attr(MESSAGE_ID_ATTR, "false_7900@c.us_M1")
            .with_child(DomNode::new("img"))
            .with_child(DomNode::new("span").with_attr("data-icon", "document"));
        let message = extractor.extract(&node, Utc::now()).unwrap().unwrap();
        assert!(message.has_media);
        assert!(message.has_document);
        assert!(message.text.is_empty());
    }

    #[test]
    fn malformed_node_does_not_stop_the_batch() {
        let mut extractor = MessageExtractor::new();
        let wrapper = DomNode::new("div")
            .with_child(row("garbage-id", "x"))
            .with_child(row("false_7911@c.us_A", "first"))
            .with_child(DomNode::new("div").with_attr(MESSAGE_ID_ATTR, "false_7922@c.us_EMPTY"))
            .with_child(row("false_7933@g.us_B", "second"));

        let messages = extractor.process(&batch(vec![wrapper]), Utc::now());
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["first", "second"]);
        assert_eq!(extractor.seen(), 2);
    }

    #[test]
    fn row_rendered_late_is_picked_up_on_a_later_mutation() {
        let mut extractor = MessageExtractor::new();
        let id = "false_79990000001@c.us_LATE";
        let placeholder = DomNode::new("div").with_attr(MESSAGE_ID_ATTR, id);
        assert!(extractor.process(&batch(vec![placeholder]), Utc::now()).is_empty());
        assert_eq!(extractor.seen(), 0);

        let messages = extractor.process(&batch(vec![row(id, "арендатор на месте")]), Utc::now());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "арендатор на месте");
        assert!(extractor.process(&batch(vec![row(id, "арендатор на месте")]), Utc::now()).is_empty());
    }

    #[test]
    fn seen_ids_are_bounded_oldest_first() {
        let mut extractor = MessageExtractor::with_capacity(2);
        for id in ["false_7901@c.us_A", "false_7901@c.us_B", "false_7901@c.us_C"] {
            assert!(extractor.extract(&row(id, "x"), Utc::now()).unwrap().is_some());
        }
        assert_eq!(extractor.seen(), 2);
        // `A` was forgotten, `C` is still remembered.
        assert!(extractor.extract(&row("false_7901@c.us_C", "x"), Utc::now()).unwrap().is_none());
        assert!(extractor.extract(&row("false_7901@c.us_A", "x"), Utc::now()).unwrap().is_some());
    }

    #[test]
    fn direct_extract_reports_extraction_failure() {
        let mut extractor = MessageExtractor::new();
        let err = extractor
            .extract(&row("not-a-message-id", "x"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, RelayError::ExtractionFailure(_)));
    }
}
