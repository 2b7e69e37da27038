//! In-process link backed by a pair of bounded tokio mpsc queues.
//!
//! Used to wire contexts living in the same process and by tests. A
//! [`LinkControl`] can sever the link to simulate a torn-down context:
//! while severed every send fails and nothing is delivered.

use super::traits::{Channel, ChannelEnd};
use crate::protocol::{Envelope, RelayError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct LinkState {
    severed: AtomicBool,
}

pub struct MemoryChannel {
    name: String,
    tx: mpsc::Sender<Envelope>,
    link: Arc<LinkState>,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<(), RelayError> {
        if self.link.severed.load(Ordering::SeqCst) {
            return Err(RelayError::TransportFailure(format!(
                "link `{}` is severed",
                self.name
            )));
        }
        self.tx.send(envelope).await.map_err(|_| {
            RelayError::TransportFailure(format!("receiver of `{}` is gone", self.name))
        })
    }
}

/// Switch shared by both directions of a duplex link.
#[derive(Clone)]
pub struct LinkControl {
    link: Arc<LinkState>,
}

impl LinkControl {
    pub fn sever(&self) {
        self.link.severed.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.link.severed.store(false, Ordering::SeqCst);
    }

    pub fn is_severed(&self) -> bool {
        self.link.severed.load(Ordering::SeqCst)
    }
}

/// Create a connected pair of channel ends named `a` and `b`.
pub fn duplex(a: &str, b: &str, capacity: usize) -> (ChannelEnd, ChannelEnd, LinkControl) {
    let capacity = capacity.max(1);
    let link = Arc::new(LinkState::default());
    let (a_to_b, b_inbox) = mpsc::channel(capacity);
    let (b_to_a, a_inbox) = mpsc::channel(capacity);

    let a_sender = MemoryChannel {
        name: format!("{a}->{b}"),
        tx: a_to_b,
        link: Arc::clone(&link),
    };
    let b_sender = MemoryChannel {
        name: format!("{b}->{a}"),
        tx: b_to_a,
        link: Arc::clone(&link),
    };

    (
        ChannelEnd::new(Arc::new(a_sender), a_inbox),
        ChannelEnd::new(Arc::new(b_sender), b_inbox),
        LinkControl { link },
    )
}
