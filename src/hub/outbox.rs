use crate::integrations::IntegrationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;

/// A message waiting for delivery through a messaging integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: String,
    pub integration: IntegrationKind,
    pub recipient: String,
    pub text: String,
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboxItem {
    pub fn new(
        integration: IntegrationKind,
        recipient: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            integration,
            recipient: recipient.into(),
            text: text.into(),
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Arguments for the integration's `send` operation.
    pub fn send_args(&self) -> Value {
        json!({ "recipient": self.recipient, "text": self.text })
    }
}

/// FIFO of pending deliveries, drained one item at a time by the scheduler.
#[derive(Debug, Default, Clone)]
pub struct Outbox {
    items: VecDeque<OutboxItem>,
}

impl Outbox {
    pub fn from_items(items: Vec<OutboxItem>) -> Self {
        Self {
            items: items.into(),
        }
    }

    pub fn push(&mut self, item: OutboxItem) -> usize {
        self.items.push_back(item);
        self.items.len()
    }

    pub fn pop(&mut self) -> Option<OutboxItem> {
        self.items.pop_front()
    }

    /// Record a failed attempt. The item goes to the back of the queue unless
    /// it has used up `max_attempts`, in which case it is handed back.
    pub fn retry_or_drop(&mut self, mut item: OutboxItem, max_attempts: u32) -> Option<OutboxItem> {
        item.attempts += 1;
        if item.attempts >= max_attempts {
            Some(item)
        } else {
            self.items.push_back(item);
            None
        }
    }

    pub fn snapshot(&self) -> Vec<OutboxItem> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
