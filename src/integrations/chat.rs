//! Chat automation integration: the "external system" is the Agent running
//! inside the chat web client, reached over its own channel.

use super::traits::{Credentials, Integration, IntegrationError, IntegrationKind};
use crate::channel::Channel;
use crate::correlator::Correlator;
use crate::protocol::{CallKind, Envelope, IdSource, RelayError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The Hub's end of the Agent link. At most one Agent is attached at a time;
/// attaching a new one replaces the old sender.
pub struct AgentLink {
    sender: RwLock<Option<(u64, Arc<dyn Channel>)>>,
    next_token: AtomicU64,
    correlator: Correlator,
}

impl AgentLink {
    pub fn new(ids: Arc<dyn IdSource>, timeout: Duration) -> Self {
        Self {
            sender: RwLock::new(None),
            next_token: AtomicU64::new(1),
            correlator: Correlator::new(ids, timeout),
        }
    }

    /// Attach an Agent; the returned token identifies this attachment.
    pub fn attach(&self, sender: Arc<dyn Channel>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let previous = self.sender.write().replace((token, sender));
        if previous.is_some() {
            tracing::info!("Agent link replaced");
        }
        token
    }

    /// Forget the Agent attached under `token` and fail everything still
    /// waiting on it. A stale token (the Agent was already replaced) is a
    /// no-op and returns `None`.
    pub fn detach(&self, token: u64) -> Option<usize> {
        {
            let mut sender = self.sender.write();
            if sender.as_ref().map(|(current, _)| *current) != Some(token) {
                return None;
            }
            sender.take();
        }
        Some(
            self.correlator
                .reject_all(&RelayError::TransportFailure("agent link closed".into())),
        )
    }

    pub fn is_attached(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Complete a Hub→Agent call from the Agent's response envelope.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(id) = envelope.correlation_id.clone() else {
            return false;
        };
        self.correlator.resolve(&id, envelope.into_result())
    }

    pub async fn call(&self, kind: CallKind, data: Value) -> Result<Value, RelayError> {
        let sender = self
            .sender
            .read()
            .as_ref()
            .map(|(_, sender)| Arc::clone(sender))
            .ok_or_else(|| RelayError::NotConnected(IntegrationKind::Chat.to_string()))?;

        let pending = self.correlator.register(kind.as_str());
        let envelope = Envelope::call(kind.as_str(), data, pending.correlation_id());
        if let Err(err) = sender.send(envelope).await {
            self.correlator.cancel(pending.correlation_id(), err.clone());
            return Err(err);
        }
        pending.wait().await
    }
}

pub struct ChatIntegration {
    link: Arc<AgentLink>,
}

impl ChatIntegration {
    pub fn new(link: Arc<AgentLink>) -> Self {
        Self { link }
    }
}

fn from_relay(err: RelayError) -> IntegrationError {
    match err {
        RelayError::AuthExpired(msg) => IntegrationError::AuthExpired(msg),
        RelayError::InvalidRequest(msg) => IntegrationError::InvalidArgs(msg),
        RelayError::NotImplemented(msg) => IntegrationError::UnsupportedOperation(msg),
        RelayError::Timeout(_)
        | RelayError::TransportFailure(_)
        | RelayError::ContextTornDown
        | RelayError::NotConnected(_) => IntegrationError::Transport(err.to_string()),
        other => IntegrationError::Remote(other.to_string()),
    }
}

#[async_trait]
impl Integration for ChatIntegration {
    fn kind(&self) -> IntegrationKind {
        IntegrationKind::Chat
    }

    async fn connect(&self, params: &Value) -> Result<Credentials, IntegrationError> {
        let reply = self
            .link
            .call(CallKind::Handshake, params.clone())
            .await
            .map_err(from_relay)?;
        Ok(Credentials {
            extra: reply,
            ..Credentials::default()
        })
    }

    async fn health_check(&self, _credentials: &Credentials) -> bool {
        match self.link.call(CallKind::Ping, Value::Null).await {
            Ok(reply) => reply.get("ready").and_then(Value::as_bool).unwrap_or(true),
            Err(e) => {
                tracing::debug!("Agent health check failed: {e}");
                false
            }
        }
    }

    async fn operate(
        &self,
        _credentials: &Credentials,
        op: &str,
        args: &Value,
    ) -> Result<Value, IntegrationError> {
        let kind = match op {
            "send" => CallKind::SendMessage,
            "status" => CallKind::GetStatus,
            other => return Err(IntegrationError::UnsupportedOperation(other.to_string())),
        };
        let data = if kind == CallKind::SendMessage {
            // Outbox items address the contact as `recipient`.
            let mut data = args.clone();
            if let Some(map) = data.as_object_mut() {
                if !map.contains_key("contact_id") {
                    if let Some(recipient) = args.get("recipient") {
                        map.insert("contact_id".into(), recipient.clone());
                    }
                }
            }
            data
        } else {
            json!({})
        };
        self.link.call(kind, data).await.map_err(from_relay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::duplex;
    use crate::protocol::SequentialIdSource;

    fn link() -> Arc<AgentLink> {
        Arc::new(AgentLink::new(
            Arc::new(SequentialIdSource::deterministic()),
            Duration::from_secs(30),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn call_without_agent_is_not_connected() {
        let chat = ChatIntegration::new(link());
        let err = chat.connect(&Value::Null).await.unwrap_err();
        assert!(matches!(err, IntegrationError::Transport(_)));
        assert!(!chat.health_check(&Credentials::default()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn send_maps_recipient_to_contact_id() {
        let link = link();
        let (hub_end, mut agent_end, _control) = duplex("hub", "agent", 8);
        link.attach(hub_end.sender);

        let responder = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                let call = agent_end.inbox.recv().await.unwrap();
                assert_eq!(call.kind, "send_message");
                assert_eq!(call.payload["contact_id"], "79991234567");
                let id = call.correlation_id.clone().unwrap();
                link.resolve(Envelope::response(id, &Ok(json!({ "sent": true }))));
            })
        };

        let chat = ChatIntegration::new(Arc::clone(&link));
        let result = chat
            .operate(
                &Credentials::default(),
                "send",
                &json!({ "recipient": "79991234567", "text": "hi" }),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({ "sent": true }));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn detach_fails_outstanding_calls() {
        let link = link();
        let (hub_end, _agent_end, _control) = duplex("hub", "agent", 8);
        let token = link.attach(hub_end.sender);

        let waiting = tokio::spawn({
            let link = Arc::clone(&link);
            async move { link.call(CallKind::Ping, Value::Null).await }
        });
        while link.correlator.is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(link.detach(token + 1), None);
        assert_eq!(link.detach(token), Some(1));
        assert!(!link.is_attached());
        assert!(matches!(
            waiting.await.unwrap(),
            Err(RelayError::TransportFailure(_))
        ));
    }
}
