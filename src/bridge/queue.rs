use crate::protocol::RelayError;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// A call parked while the Hub was unreachable.
///
/// Only the call itself is kept, not an envelope: on drain it is issued as
/// a fresh call with a new correlation id.
pub(crate) struct OutboundQueueItem {
    pub kind: String,
    pub data: Value,
    pub reply: oneshot::Sender<Result<Value, RelayError>>,
}

/// FIFO of parked calls.
#[derive(Default)]
pub(crate) struct OutboundQueue {
    items: VecDeque<OutboundQueueItem>,
}

impl OutboundQueue {
    pub fn push(&mut self, item: OutboundQueueItem) {
        self.items.push_back(item);
    }

    pub fn take_all(&mut self) -> Vec<OutboundQueueItem> {
        self.items.drain(..).collect()
    }

    /// Put items back ahead of anything queued since they were taken,
    /// keeping their relative order.
    pub fn requeue_front(&mut self, items: impl IntoIterator<Item = OutboundQueueItem>) {
        let items: Vec<OutboundQueueItem> = items.into_iter().collect();
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
