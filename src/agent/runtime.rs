//! Agent event loop.
//!
//! Lifecycle is `Loading -> Ready -> Disconnected`. Loading waits a bounded
//! time for the chat client's markers and falls back to a best-effort Ready.
//! While Ready the Agent answers Hub calls, turns DOM mutations into
//! `new_inbound_message` events and runs the silence sweep on a timer.

use super::dom::{ChatSurface, MutationRecord, StructuralChangeNotifier};
use super::extract::{ChatMessage, Direction, MessageExtractor};
use super::sender::OutboundSender;
use super::silence::{SilenceMonitor, SilencePolicy, SilenceReport};
use crate::channel::{Channel, ChannelEnd};
use crate::config::AgentConfig;
use crate::protocol::{
    decode_data, CallKind, Envelope, Event, EventKind, RelayError, SendMessageRequest,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    /// `best_effort` is set when the markers never showed up.
    Ready { best_effort: bool },
    Disconnected,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Ready { .. } => "ready",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

struct AgentInner {
    config: AgentConfig,
    surface: Arc<dyn ChatSurface>,
    sender: OutboundSender,
    /// Serializes UI driving between concurrent send calls.
    ui: tokio::sync::Mutex<()>,
    phase: Mutex<Phase>,
    extractor: Mutex<MessageExtractor>,
    monitor: Mutex<SilenceMonitor>,
}

#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(config: &AgentConfig, surface: Arc<dyn ChatSurface>) -> Result<Self> {
        let policy = SilencePolicy::from_config(config)?;
        Ok(Self {
            inner: Arc::new(AgentInner {
                config: config.clone(),
                sender: OutboundSender::new(Arc::clone(&surface), config),
                surface,
                ui: tokio::sync::Mutex::new(()),
                phase: Mutex::new(Phase::Loading),
                extractor: Mutex::new(MessageExtractor::new()),
                monitor: Mutex::new(SilenceMonitor::new(policy)),
            }),
        })
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock()
    }

    fn set_phase(&self, phase: Phase) {
        *self.inner.phase.lock() = phase;
    }

    pub fn status(&self) -> Value {
        let phase = self.phase();
        let (tracked, escalated) = {
            let monitor = self.inner.monitor.lock();
            (monitor.activity().len(), monitor.escalated().len())
        };
        json!({
            "integration": "chat",
            "phase": phase.as_str(),
            "ready": phase.is_ready(),
            "best_effort": matches!(phase, Phase::Ready { best_effort: true }),
            "messages_seen": self.inner.extractor.lock().seen(),
            "contacts_tracked": tracked,
            "escalated": escalated,
        })
    }

    /// Parse a mutation batch and record inbound activity. Returns the
    /// inbound messages to forward.
    pub fn observe(&self, record: &MutationRecord, now: DateTime<Utc>) -> Vec<ChatMessage> {
        let messages = self.inner.extractor.lock().process(record, now);
        let mut monitor = self.inner.monitor.lock();
        messages
            .into_iter()
            .filter(|message| {
                if message.direction == Direction::Inbound {
                    monitor.record_inbound(&message.contact_id, message.observed_at);
                    true
                } else {
                    false
                }
            })
            .collect()
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> Option<SilenceReport> {
        self.inner.monitor.lock().sweep(now)
    }

    pub async fn handle(&self, envelope: &Envelope) -> Result<Value, RelayError> {
        let Some(kind) = CallKind::parse(&envelope.kind) else {
            return Err(RelayError::UnknownRequest(envelope.kind.clone()));
        };
        match kind {
            CallKind::Ping => Ok(json!({ "pong": true, "ready": self.phase().is_ready() })),
            CallKind::GetStatus => Ok(self.status()),
            CallKind::Handshake => {
                if !self.phase().is_ready() {
                    return Err(RelayError::NotConnected("chat".into()));
                }
                Ok(self.status())
            }
            CallKind::SendMessage => {
                let request: SendMessageRequest = decode_data(&envelope.payload)?;
                if !self.phase().is_ready() {
                    return Err(RelayError::NotConnected("chat".into()));
                }
                let _ui = self.inner.ui.lock().await;
                self.inner.sender.send(&request).await
            }
            _ => Err(RelayError::UnknownRequest(envelope.kind.clone())),
        }
    }

    async fn wait_ready(&self) -> Phase {
        let surface = Arc::clone(&self.inner.surface);
        let poll = self.inner.config.ui_poll();
        let found = time::timeout(self.inner.config.ready_timeout(), async move {
            while !surface.has_markers().await {
                time::sleep(poll).await;
            }
        })
        .await
        .is_ok();

        if !found {
            tracing::warn!(
                timeout = ?self.inner.config.ready_timeout(),
                "Chat client markers not found, continuing best-effort"
            );
        }
        Phase::Ready { best_effort: !found }
    }

    /// Drive the Agent until the Hub link closes or `shutdown` fires.
    pub async fn run(
        self,
        end: ChannelEnd,
        changes: StructuralChangeNotifier,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let ChannelEnd { sender: hub, mut inbox } = end;
        emit(&hub, EventKind::StatusUpdate, self.status()).await;

        let phase = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            phase = self.wait_ready() => phase,
        };
        self.set_phase(phase);
        tracing::info!(phase = phase.as_str(), "Agent ready");
        emit(&hub, EventKind::IntegrationReady, self.status()).await;

        let period = self.inner.config.sweep_interval().max(Duration::from_secs(1));
        let mut sweeps =
            time::interval_at(Instant::now() + self.inner.config.first_sweep_delay(), period);
        sweeps.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut changes = Some(changes);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = inbox.recv() => {
                    let Some(envelope) = received else {
                        tracing::info!("Hub link closed, agent stopping");
                        break;
                    };
                    self.dispatch(envelope, &hub);
                }
                record = next_change(&mut changes) => match record {
                    Some(record) => {
                        for message in self.observe(&record, Utc::now()) {
                            tracing::debug!(id = %message.id, contact = %message.contact_id, "Inbound message");
                            let data = serde_json::to_value(&message).unwrap_or(Value::Null);
                            emit(&hub, EventKind::NewInboundMessage, data).await;
                        }
                    }
                    None => {
                        changes = None;
                        self.set_phase(Phase::Disconnected);
                        tracing::warn!("Chat client document went away");
                        emit(
                            &hub,
                            EventKind::IntegrationDisconnected,
                            json!({ "integration": "chat", "reason": "chat client document closed" }),
                        )
                        .await;
                    }
                },
                _ = sweeps.tick() => {
                    let now = Utc::now();
                    if let Some(report) = self.sweep(now) {
                        tracing::info!(
                            silent = report.silent.len(),
                            to_transfer = report.to_transfer.len(),
                            "Silence sweep"
                        );
                        let mut data = serde_json::to_value(&report).unwrap_or(Value::Null);
                        if let Some(map) = data.as_object_mut() {
                            map.insert("swept_at".into(), json!(now));
                        }
                        emit(&hub, EventKind::SilenceReport, data).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Answer one Hub call on its own task.
    fn dispatch(&self, envelope: Envelope, hub: &Arc<dyn Channel>) {
        if envelope.is_response() || envelope.is_event() {
            tracing::debug!(kind = %envelope.kind, "Ignoring non-call envelope from hub");
            return;
        }
        let Some(correlation_id) = envelope.correlation_id.clone() else {
            tracing::debug!(kind = %envelope.kind, "Ignoring uncorrelated call");
            return;
        };
        let agent = self.clone();
        let hub = Arc::clone(hub);
        tokio::spawn(async move {
            let result = agent.handle(&envelope).await;
            if let Err(ref e) = result {
                tracing::debug!(kind = %envelope.kind, correlation_id = %correlation_id, "Agent call failed: {e}");
            }
            if let Err(e) = hub.send(Envelope::response(correlation_id, &result)).await {
                tracing::debug!("Agent response undeliverable: {e}");
            }
        });
    }
}

async fn next_change(changes: &mut Option<StructuralChangeNotifier>) -> Option<MutationRecord> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn emit(hub: &Arc<dyn Channel>, kind: EventKind, data: Value) {
    if let Err(e) = hub.send(Envelope::event(&Event::new(kind, data))).await {
        tracing::debug!(event = ?kind, "Event undeliverable: {e}");
    }
}
