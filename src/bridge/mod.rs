//! Page-side proxy exposing a uniform call/subscribe API.
//!
//! The Bridge owns three things on top of its [`Correlator`]:
//! - a liveness probe (`ping` on a fixed interval, or immediately when a
//!   call is queued),
//! - the outbound queue for calls issued while the Hub is unreachable,
//!   drained FIFO exactly once per disconnected→connected transition,
//! - fan-out of Hub events and connectivity changes to page subscribers.
//!
//! Teardown is explicit ([`Bridge::teardown`]). Nothing runs it when the
//! process is killed outright; in that case outstanding callers simply never
//! hear back.

mod queue;

use crate::channel::{Channel, ChannelEnd};
use crate::config::BridgeConfig;
use crate::correlator::{Correlator, PendingReply};
use crate::protocol::{CallKind, Envelope, Event, IdSource, RelayError};
use parking_lot::Mutex;
use queue::{OutboundQueue, OutboundQueueItem};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 256;

/// What the hosting page gets to observe.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    ConnectivityChanged {
        connected: bool,
        reason: Option<String>,
    },
    Hub(Event),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connectivity {
    /// No probe has answered yet
    Starting,
    Connected,
    Disconnected,
}

struct LinkState {
    connectivity: Connectivity,
    draining: bool,
    torn_down: bool,
    queue: OutboundQueue,
}

struct BridgeInner {
    channel: Arc<dyn Channel>,
    correlator: Correlator,
    state: Mutex<LinkState>,
    events: broadcast::Sender<PageEvent>,
    probe_now: Notify,
    origin: String,
    probe_interval: Duration,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Start the Bridge over `end`: spawns the inbound dispatcher and the
    /// probe loop. The first probe goes out immediately.
    pub fn start(end: ChannelEnd, config: &BridgeConfig, ids: Arc<dyn IdSource>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let bridge = Self {
            inner: Arc::new(BridgeInner {
                channel: end.sender,
                correlator: Correlator::new(ids, config.call_timeout()),
                state: Mutex::new(LinkState {
                    connectivity: Connectivity::Starting,
                    draining: false,
                    torn_down: false,
                    queue: OutboundQueue::default(),
                }),
                events,
                probe_now: Notify::new(),
                origin: config.origin.clone(),
                probe_interval: config.probe_interval(),
                shutdown: CancellationToken::new(),
            }),
        };

        tokio::spawn(bridge.clone().run_inbound(end.inbox));
        tokio::spawn(bridge.clone().run_probe_loop());
        bridge
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connectivity == Connectivity::Connected
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn pending(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Issue a call to the Hub.
    ///
    /// While disconnected the call is parked in the outbound queue and a
    /// probe is requested; the returned future completes only after the
    /// link is back and the queue has been drained.
    pub async fn call(&self, kind: &str, data: Value) -> Result<Value, RelayError> {
        let parked = {
            let mut state = self.inner.state.lock();
            if state.torn_down {
                return Err(RelayError::ContextTornDown);
            }
            if state.connectivity == Connectivity::Connected {
                None
            } else {
                let (reply, rx) = oneshot::channel();
                state.queue.push(OutboundQueueItem {
                    kind: kind.to_string(),
                    data: data.clone(),
                    reply,
                });
                Some(rx)
            }
        };

        if let Some(rx) = parked {
            tracing::debug!(kind, "Hub unreachable, call queued");
            self.inner.probe_now.notify_one();
            return rx.await.unwrap_or(Err(RelayError::ContextTornDown));
        }

        self.dispatch(kind, data).await?.wait().await
    }

    /// Reject every outstanding and queued call and stop background tasks.
    pub fn teardown(&self) {
        let queued = {
            let mut state = self.inner.state.lock();
            state.torn_down = true;
            state.queue.take_all()
        };
        for item in queued {
            let _ = item.reply.send(Err(RelayError::ContextTornDown));
        }
        let rejected = self
            .inner
            .correlator
            .reject_all(&RelayError::ContextTornDown);
        self.inner.shutdown.cancel();
        tracing::info!(rejected, "Bridge torn down");
    }

    /// Register and send one call. Never consults the queue.
    async fn dispatch(&self, kind: &str, data: Value) -> Result<PendingReply, RelayError> {
        let pending = self.inner.correlator.register(kind);
        let envelope = Envelope::call(kind, data, pending.correlation_id())
            .with_origin(self.inner.origin.clone());

        if let Err(err) = self.inner.channel.send(envelope).await {
            self.inner
                .correlator
                .cancel(pending.correlation_id(), err.clone());
            self.mark_disconnected(&err.to_string());
            return Err(err);
        }
        Ok(pending)
    }

    async fn probe(&self) {
        let alive = match self.dispatch(CallKind::Ping.as_str(), Value::Null).await {
            Ok(pending) => {
                let id = pending.correlation_id().to_string();
                match tokio::time::timeout(self.inner.probe_interval, pending.wait()).await {
                    // Any reply, even an error, proves the Hub is there.
                    Ok(result) => !matches!(
                        result,
                        Err(RelayError::Timeout(_)
                            | RelayError::TransportFailure(_)
                            | RelayError::ContextTornDown)
                    ),
                    Err(_) => {
                        self.inner
                            .correlator
                            .cancel(&id, RelayError::Timeout(self.inner.probe_interval));
                        false
                    }
                }
            }
            Err(_) => false,
        };

        if alive {
            self.on_link_up().await;
        } else {
            self.mark_disconnected("probe failed");
        }
    }

    async fn on_link_up(&self) {
        let start_drain = {
            let mut state = self.inner.state.lock();
            if state.torn_down
                || state.draining
                || state.connectivity == Connectivity::Connected
            {
                false
            } else {
                state.draining = true;
                true
            }
        };
        if start_drain {
            self.drain().await;
        }
    }

    /// Re-issue queued calls in FIFO order as fresh calls. Calls queued while
    /// draining join the tail; the link is declared connected only once the
    /// queue is observed empty, so nothing can overtake an older call.
    async fn drain(&self) {
        let mut drained = 0usize;
        loop {
            let batch = {
                let mut state = self.inner.state.lock();
                if state.queue.is_empty() {
                    state.connectivity = Connectivity::Connected;
                    state.draining = false;
                    None
                } else {
                    Some(state.queue.take_all())
                }
            };
            let Some(batch) = batch else { break };

            let mut items = batch.into_iter();
            while let Some(item) = items.next() {
                match self.dispatch(&item.kind, item.data.clone()).await {
                    Ok(pending) => {
                        drained += 1;
                        tokio::spawn(async move {
                            let _ = item.reply.send(pending.wait().await);
                        });
                    }
                    Err(err) => {
                        tracing::warn!("Queue drain interrupted: {err}");
                        let mut state = self.inner.state.lock();
                        state.queue.requeue_front(std::iter::once(item).chain(items));
                        state.draining = false;
                        return;
                    }
                }
            }
        }

        tracing::info!(drained, "Hub link up");
        self.emit(PageEvent::ConnectivityChanged {
            connected: true,
            reason: None,
        });
    }

    fn mark_disconnected(&self, reason: &str) {
        let previous = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.connectivity, Connectivity::Disconnected)
        };
        if previous != Connectivity::Disconnected {
            tracing::warn!(reason, "Hub link down");
            self.emit(PageEvent::ConnectivityChanged {
                connected: false,
                reason: Some(reason.to_string()),
            });
        }
    }

    fn emit(&self, event: PageEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    async fn run_inbound(self, mut inbox: mpsc::Receiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                received = inbox.recv() => received,
            };
            let Some(envelope) = envelope else {
                self.mark_disconnected("link closed");
                break;
            };

            if envelope.is_response() {
                let id = envelope.correlation_id.clone().unwrap_or_default();
                self.inner.correlator.resolve(&id, envelope.into_result());
            } else if let Some(event) = envelope.to_event() {
                self.emit(PageEvent::Hub(event));
            } else {
                tracing::debug!(kind = %envelope.kind, "Ignoring unexpected envelope");
            }
        }
    }

    async fn run_probe_loop(self) {
        let mut interval = tokio::time::interval(self.inner.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {}
                () = self.inner.probe_now.notified() => {}
            }
            self.probe().await;
        }
    }
}
