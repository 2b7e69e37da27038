use super::error::{RelayError, WireError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Envelope kind used for replies to a correlated call.
pub const RESPONSE_KIND: &str = "response";
/// Envelope kind used for one-way events.
pub const EVENT_KIND: &str = "event";

/// Unit of transfer between two contexts.
///
/// `correlation_id` is set on calls and their responses only; events never
/// carry one. `origin` is checked by the Hub before any routing happens; on
/// an attached page link the Hub overwrites it with the link's own origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Envelope {
    pub fn call(kind: impl Into<String>, data: Value, correlation_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: data,
            correlation_id: Some(correlation_id.into()),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Build the reply for `correlation_id`. Errors are flattened into a
    /// `{success:false, error, code}` payload instead of being dropped.
    pub fn response(correlation_id: impl Into<String>, result: &Result<Value, RelayError>) -> Self {
        let payload = match result {
            Ok(data) => json!({ "success": true, "data": data }),
            Err(err) => {
                let wire = err.to_wire();
                json!({
                    "success": false,
                    "error": wire.error,
                    "code": wire.code,
                    "detail": wire.detail,
                })
            }
        };
        Self {
            kind: RESPONSE_KIND.to_string(),
            payload,
            correlation_id: Some(correlation_id.into()),
            origin: None,
        }
    }

    pub fn event(event: &Event) -> Self {
        Self {
            kind: EVENT_KIND.to_string(),
            payload: json!({ "event": event.event, "data": event.data }),
            correlation_id: None,
            origin: None,
        }
    }

    pub fn is_response(&self) -> bool {
        self.kind == RESPONSE_KIND && self.correlation_id.is_some()
    }

    pub fn is_event(&self) -> bool {
        self.kind == EVENT_KIND
    }

    /// Decode a response payload back into the caller's result.
    pub fn into_result(self) -> Result<Value, RelayError> {
        let success = self
            .payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if success {
            return Ok(self.payload.get("data").cloned().unwrap_or(Value::Null));
        }
        let wire = WireError {
            code: string_field(&self.payload, "code"),
            error: string_field(&self.payload, "error"),
            detail: string_field(&self.payload, "detail"),
        };
        Err(RelayError::from_wire(&wire))
    }

    pub fn to_event(&self) -> Option<Event> {
        if !self.is_event() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

fn string_field(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Decode the `data` of a call into its typed request.
pub fn decode_data<T: DeserializeOwned>(payload: &Value) -> Result<T, RelayError> {
    let source = if payload.is_null() {
        json!({})
    } else {
        payload.clone()
    };
    serde_json::from_value(source).map_err(|e| RelayError::InvalidRequest(e.to_string()))
}

/// Call kinds understood by at least one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Ping,
    GetStatus,
    Connect,
    Disconnect,
    Operate,
    SendMessage,
    QueueMessage,
    UpdateSettings,
    ClearCache,
    Handshake,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::GetStatus => "get_status",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Operate => "operate",
            Self::SendMessage => "send_message",
            Self::QueueMessage => "queue_message",
            Self::UpdateSettings => "update_settings",
            Self::ClearCache => "clear_cache",
            Self::Handshake => "handshake",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        let parsed = match kind {
            "ping" => Self::Ping,
            "get_status" => Self::GetStatus,
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "operate" => Self::Operate,
            "send_message" => Self::SendMessage,
            "queue_message" => Self::QueueMessage,
            "update_settings" => Self::UpdateSettings,
            "clear_cache" => Self::ClearCache,
            "handshake" => Self::Handshake,
            _ => return None,
        };
        Some(parsed)
    }
}

/// One-way notifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IntegrationReady,
    NewInboundMessage,
    IntegrationDisconnected,
    CredentialExpired,
    SilenceReport,
    StatusUpdate,
    GenericError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event: EventKind,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(event: EventKind, data: Value) -> Self {
        Self { event, data }
    }
}

// ── Typed call payloads ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectRequest {
    pub integration: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisconnectRequest {
    pub integration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperateRequest {
    pub integration: String,
    pub op: String,
    #[serde(default)]
    pub args: Value,
    /// Overrides the derived cache key for cacheable operations.
    #[serde(default)]
    pub cache_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub contact_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMessageRequest {
    pub integration: String,
    pub recipient: String,
    pub text: String,
}
