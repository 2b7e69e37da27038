//! Closed dispatch over call kinds. The origin check runs before anything
//! else; every failure comes back as a `RelayError` for the response
//! envelope, never as a panic or a dropped call.

use super::{parse_integration, Hub, OutboxItem};
use crate::integrations::IntegrationKind;
use crate::protocol::{
    decode_data, CallKind, ConnectRequest, DisconnectRequest, Envelope, OperateRequest,
    QueueMessageRequest, RelayError, SendMessageRequest,
};
use serde_json::{json, Value};

impl Hub {
    pub async fn handle(&self, envelope: &Envelope) -> Result<Value, RelayError> {
        let origin = envelope.origin.as_deref();
        if !self.is_origin_allowed(origin) {
            tracing::warn!(origin = ?origin, kind = %envelope.kind, "Rejected call from disallowed origin");
            return Err(RelayError::Unauthorized(
                origin.unwrap_or("<none>").to_string(),
            ));
        }

        let Some(kind) = CallKind::parse(&envelope.kind) else {
            return Err(RelayError::UnknownRequest(envelope.kind.clone()));
        };
        let data = &envelope.payload;

        match kind {
            CallKind::Ping => Ok(json!({ "pong": true })),
            CallKind::GetStatus => Ok(self.status()),
            CallKind::Connect => {
                let request: ConnectRequest = decode_data(data)?;
                let integration = parse_integration(&request.integration)?;
                self.connect(integration, &request.params, origin.map(str::to_string))
                    .await
            }
            CallKind::Disconnect => {
                let request: DisconnectRequest = decode_data(data)?;
                let integration = parse_integration(&request.integration)?;
                Ok(self.disconnect(integration, "requested by caller").await)
            }
            CallKind::Operate => {
                let request: OperateRequest = decode_data(data)?;
                self.operate(request).await
            }
            CallKind::SendMessage => {
                let request: SendMessageRequest = decode_data(data)?;
                if request.contact_id.trim().is_empty() {
                    return Err(RelayError::InvalidRequest("`contact_id` is empty".into()));
                }
                let args = serde_json::to_value(&request)
                    .map_err(|e| RelayError::InvalidRequest(e.to_string()))?;
                self.operate(OperateRequest {
                    integration: IntegrationKind::Chat.to_string(),
                    op: "send".into(),
                    args,
                    cache_key: None,
                })
                .await
            }
            CallKind::QueueMessage => {
                let request: QueueMessageRequest = decode_data(data)?;
                let integration = parse_integration(&request.integration)?;
                if !integration.can_deliver_messages() {
                    return Err(RelayError::InvalidRequest(format!(
                        "integration `{integration}` cannot deliver messages"
                    )));
                }
                if request.recipient.trim().is_empty() || request.text.trim().is_empty() {
                    return Err(RelayError::InvalidRequest(
                        "`recipient` and `text` are required".into(),
                    ));
                }
                let item = OutboxItem::new(integration, request.recipient, request.text);
                let id = item.id.clone();
                let position = self.enqueue(item);
                self.persist_logged().await;
                Ok(json!({ "queued": id, "position": position }))
            }
            CallKind::UpdateSettings => {
                let Some(partial) = data.as_object() else {
                    return Err(RelayError::InvalidRequest(
                        "settings update must be an object".into(),
                    ));
                };
                let settings = self.update_settings(partial);
                self.persist_logged().await;
                Ok(settings)
            }
            CallKind::ClearCache => Ok(json!({ "cleared": self.clear_cache() })),
            // Hub→Agent only.
            CallKind::Handshake => Err(RelayError::UnknownRequest(envelope.kind.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::hub::{Hub, StateStore};
    use crate::integrations::AgentLink;
    use crate::protocol::{Envelope, RelayError, SequentialIdSource};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    async fn hub() -> Hub {
        let agent = Arc::new(AgentLink::new(
            Arc::new(SequentialIdSource::deterministic()),
            Duration::from_secs(30),
        ));
        Hub::new(&Config::default(), Vec::new(), agent, StateStore::in_memory())
            .await
            .unwrap()
    }

    fn call(kind: &str, data: Value) -> Envelope {
        Envelope::call(kind, data, "1").with_origin("app://switchboard")
    }

    #[tokio::test]
    async fn disallowed_origin_never_reaches_routing() {
        let hub = hub().await;
        let envelope = Envelope::call("clear_cache", Value::Null, "1").with_origin("https://evil.example");
        assert_eq!(
            hub.handle(&envelope).await,
            Err(RelayError::Unauthorized("https://evil.example".into()))
        );

        let anonymous = Envelope::call("ping", Value::Null, "2");
        assert!(matches!(
            hub.handle(&anonymous).await,
            Err(RelayError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kind_is_reported_not_panicked() {
        let hub = hub().await;
        assert_eq!(
            hub.handle(&call("launch", Value::Null)).await,
            Err(RelayError::UnknownRequest("launch".into()))
        );
        assert_eq!(
            hub.handle(&call("handshake", Value::Null)).await,
            Err(RelayError::UnknownRequest("handshake".into()))
        );
    }

    #[tokio::test]
    async fn ping_and_status() {
        let hub = hub().await;
        assert_eq!(hub.handle(&call("ping", Value::Null)).await.unwrap(), json!({ "pong": true }));
        let status = hub.handle(&call("get_status", Value::Null)).await.unwrap();
        assert_eq!(status["sessions"]["sms"]["connected"], false);
        assert_eq!(status["agent_attached"], false);
    }

    #[tokio::test]
    async fn settings_merge_and_remove() {
        let hub = hub().await;
        hub.handle(&call("update_settings", json!({ "delay": 5, "template": "hi" })))
            .await
            .unwrap();
        let settings = hub
            .handle(&call("update_settings", json!({ "template": null })))
            .await
            .unwrap();
        assert_eq!(settings, json!({ "delay": 5 }));

        assert!(matches!(
            hub.handle(&call("update_settings", json!([1, 2]))).await,
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn queue_message_validates_integration() {
        let hub = hub().await;
        let queued = hub
            .handle(&call(
                "queue_message",
                json!({ "integration": "sms", "recipient": "79991234567", "text": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(queued["position"], 1);
        assert_eq!(hub.outbox_len(), 1);

        assert!(matches!(
            hub.handle(&call(
                "queue_message",
                json!({ "integration": "ocr", "recipient": "x", "text": "hi" }),
            ))
            .await,
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn operate_on_unconfigured_integration_is_invalid() {
        let hub = hub().await;
        let result = hub
            .handle(&call(
                "operate",
                json!({ "integration": "spreadsheet", "op": "read", "args": { "range": "A1" } }),
            ))
            .await;
        assert!(matches!(result, Err(RelayError::InvalidRequest(_))));
    }
}
