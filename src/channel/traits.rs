use crate::protocol::{Envelope, RelayError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound half of a link between two contexts.
///
/// Delivery is at-most-once. A failed send surfaces only as
/// `RelayError::TransportFailure`; the far side is never told.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable link name, used in logs
    fn name(&self) -> &str;

    /// Hand one envelope to the transport
    async fn send(&self, envelope: Envelope) -> Result<(), RelayError>;
}

/// Both halves of a link as seen from one context.
pub struct ChannelEnd {
    pub sender: Arc<dyn Channel>,
    pub inbox: mpsc::Receiver<Envelope>,
}

impl ChannelEnd {
    pub fn new(sender: Arc<dyn Channel>, inbox: mpsc::Receiver<Envelope>) -> Self {
        Self { sender, inbox }
    }
}
