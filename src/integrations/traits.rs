use crate::protocol::RelayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// External services the Hub keeps a session for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    Spreadsheet,
    Chat,
    Ocr,
    Bot,
    Sms,
}

impl IntegrationKind {
    pub const ALL: [Self; 5] = [Self::Spreadsheet, Self::Chat, Self::Ocr, Self::Bot, Self::Sms];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spreadsheet => "spreadsheet",
            Self::Chat => "chat",
            Self::Ocr => "ocr",
            Self::Bot => "bot",
            Self::Sms => "sms",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Integrations that accept `send {recipient, text}` and can therefore
    /// take outbox items.
    pub fn can_deliver_messages(self) -> bool {
        matches!(self, Self::Chat | Self::Bot | Self::Sms)
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures reported by an integration adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    /// Credential rejected by the remote side; eligible for one refresh.
    #[error("credentials rejected: {0}")]
    AuthExpired(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("unsupported operation `{0}`")]
    UnsupportedOperation(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl IntegrationError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }

    /// Normalize into the cross-context taxonomy.
    pub fn into_relay(self, kind: IntegrationKind) -> RelayError {
        match self {
            Self::AuthExpired(_) => RelayError::AuthExpired(kind.to_string()),
            Self::Remote(msg) => RelayError::Remote(msg),
            Self::InvalidArgs(msg) => RelayError::InvalidRequest(msg),
            Self::UnsupportedOperation(op) => RelayError::NotImplemented(format!("{kind}.{op}")),
            Self::Transport(msg) => RelayError::TransportFailure(msg),
        }
    }

    /// Classify a non-success HTTP reply. 401/403 mean the credential is
    /// no longer accepted; everything else is a plain remote failure.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body = crate::util::truncate_with_ellipsis(body.trim(), 200);
        if matches!(
            status,
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
        ) {
            Self::AuthExpired(format!("{status}: {body}"))
        } else {
            Self::Remote(format!("{status}: {body}"))
        }
    }
}

impl From<reqwest::Error> for IntegrationError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Credential material returned by a handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Adapter-specific session markers (bot username, spreadsheet id, ...).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl Credentials {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// One external service behind the Hub.
///
/// Adapters are stateless with respect to sessions: the Hub owns the
/// credentials and hands them in on every call.
#[async_trait]
pub trait Integration: Send + Sync {
    fn kind(&self) -> IntegrationKind;

    /// Handshake with the external system.
    async fn connect(&self, params: &Value) -> Result<Credentials, IntegrationError>;

    /// Cheap liveness probe for an established session.
    async fn health_check(&self, credentials: &Credentials) -> bool;

    /// Run one operation against the external system.
    async fn operate(
        &self,
        credentials: &Credentials,
        op: &str,
        args: &Value,
    ) -> Result<Value, IntegrationError>;

    /// Obtain fresh credentials after an auth failure.
    async fn refresh_credentials(
        &self,
        _credentials: &Credentials,
    ) -> Result<Credentials, IntegrationError> {
        Err(IntegrationError::AuthExpired(format!(
            "{} has no refresh flow",
            self.kind()
        )))
    }

    /// Whether results of `op` may be served from the Hub cache.
    fn cacheable(&self, _op: &str) -> bool {
        false
    }
}

/// Pull a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, IntegrationError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IntegrationError::InvalidArgs(format!("missing `{key}`")))
}
