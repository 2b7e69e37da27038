//! Abstract view of the hosted chat client's document.
//!
//! The Agent never touches a real browser API. It sees the page as a tree of
//! [`DomNode`]s, learns about inserted nodes through a structural change
//! notifier (a stream of [`MutationRecord`]s) and drives the UI through the
//! [`ChatSurface`] capability.

use crate::protocol::RelayError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomNode {
    pub tag: String,
    pub classes: Vec<String>,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub children: Vec<DomNode>,
}

impl DomNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: DomNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    /// Depth-first search including `self`.
    pub fn find(&self, predicate: &dyn Fn(&DomNode) -> bool) -> Option<&DomNode> {
        if predicate(self) {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(predicate))
    }

    pub fn find_all<'a>(&'a self, predicate: &dyn Fn(&DomNode) -> bool, out: &mut Vec<&'a DomNode>) {
        if predicate(self) {
            out.push(self);
        }
        for child in &self.children {
            child.find_all(predicate, out);
        }
    }

    /// Concatenated text of this node and its descendants.
    pub fn text_content(&self) -> String {
        let mut out = self.text.clone();
        for child in &self.children {
            let inner = child.text_content();
            if !inner.is_empty() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&inner);
            }
        }
        out
    }
}

/// Nodes inserted under a watched container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: String,
    pub added: Vec<DomNode>,
}

/// Receiving side of the structural change notifier. Closing it means the
/// observed document went away.
pub type StructuralChangeNotifier = mpsc::Receiver<MutationRecord>;

/// What the Agent can do to the chat client's UI.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// The client's structural markers (app shell, message list) are present.
    async fn has_markers(&self) -> bool;

    /// Contact id of the conversation currently open, if any.
    async fn current_conversation(&self) -> Option<String>;

    async fn open_conversation(&self, contact_id: &str) -> Result<(), RelayError>;

    /// The message composer is present and accepts input.
    async fn input_ready(&self) -> bool;

    async fn type_and_submit(&self, text: &str) -> Result<(), RelayError>;
}

#[derive(Debug, Default)]
struct SurfaceState {
    markers: bool,
    open: Option<String>,
    /// Composer becomes usable after this many readiness polls.
    input_after_polls: Option<usize>,
    polls: usize,
    navigations: Vec<String>,
    sent: Vec<(String, String)>,
    fail_submit: bool,
}

/// Headless [`ChatSurface`] with a scriptable UI state.
#[derive(Debug, Default)]
pub struct MemorySurface {
    state: Mutex<SurfaceState>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_markers(&self, present: bool) {
        self.state.lock().markers = present;
    }

    /// Make the composer available after `polls` readiness checks; `None`
    /// keeps it unavailable.
    pub fn set_input_after(&self, polls: Option<usize>) {
        let mut state = self.state.lock();
        state.input_after_polls = polls;
        state.polls = 0;
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.state.lock().fail_submit = fail;
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().navigations.clone()
    }

    /// `(contact_id, text)` pairs submitted so far.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl ChatSurface for MemorySurface {
    async fn has_markers(&self) -> bool {
        self.state.lock().markers
    }

    async fn current_conversation(&self) -> Option<String> {
        self.state.lock().open.clone()
    }

    async fn open_conversation(&self, contact_id: &str) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        state.open = Some(contact_id.to_string());
        state.navigations.push(contact_id.to_string());
        state.polls = 0;
        Ok(())
    }

    async fn input_ready(&self) -> bool {
        let mut state = self.state.lock();
        state.polls += 1;
        state
            .input_after_polls
            .is_some_and(|after| state.polls > after)
    }

    async fn type_and_submit(&self, text: &str) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if state.fail_submit {
            return Err(RelayError::Remote("composer rejected input".into()));
        }
        let contact = state.open.clone().unwrap_or_default();
        state.sent.push((contact, text.to_string()));
        Ok(())
    }
}
