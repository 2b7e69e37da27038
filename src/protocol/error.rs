use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can cross a context boundary.
///
/// Every variant maps to a stable wire code so the receiving context can
/// rebuild the same variant from a `{success:false, error, code}` payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("integration `{0}` is not connected")]
    NotConnected(String),
    #[error("origin `{0}` is not allowed")]
    Unauthorized(String),
    #[error("credentials for `{0}` expired")]
    AuthExpired(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("context torn down with request outstanding")]
    ContextTornDown,
    #[error("unknown request kind `{0}`")]
    UnknownRequest(String),
    #[error("extraction failure: {0}")]
    ExtractionFailure(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("{0}")]
    Remote(String),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::NotConnected(_) => "not_connected",
            Self::Unauthorized(_) => "unauthorized",
            Self::AuthExpired(_) => "auth_expired",
            Self::TransportFailure(_) => "transport_failure",
            Self::ContextTornDown => "context_torn_down",
            Self::UnknownRequest(_) => "unknown_request",
            Self::ExtractionFailure(_) => "extraction_failure",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotImplemented(_) => "not_implemented",
            Self::Remote(_) => "remote",
        }
    }

    /// The variant's detail without the display prefix.
    fn detail(&self) -> String {
        match self {
            Self::Timeout(after) => after.as_millis().to_string(),
            Self::ContextTornDown => String::new(),
            Self::NotConnected(s)
            | Self::Unauthorized(s)
            | Self::AuthExpired(s)
            | Self::TransportFailure(s)
            | Self::UnknownRequest(s)
            | Self::ExtractionFailure(s)
            | Self::InvalidRequest(s)
            | Self::NotImplemented(s)
            | Self::Remote(s) => s.clone(),
        }
    }

    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code().to_string(),
            error: self.to_string(),
            detail: self.detail(),
        }
    }

    /// Rebuild an error received from another context. Unknown codes
    /// degrade to `Remote` carrying the human-readable message.
    pub fn from_wire(wire: &WireError) -> Self {
        let detail = wire.detail.clone();
        match wire.code.as_str() {
            "timeout" => Self::Timeout(Duration::from_millis(detail.parse().unwrap_or_default())),
            "not_connected" => Self::NotConnected(detail),
            "unauthorized" => Self::Unauthorized(detail),
            "auth_expired" => Self::AuthExpired(detail),
            "transport_failure" => Self::TransportFailure(detail),
            "context_torn_down" => Self::ContextTornDown,
            "unknown_request" => Self::UnknownRequest(detail),
            "extraction_failure" => Self::ExtractionFailure(detail),
            "invalid_request" => Self::InvalidRequest(detail),
            "not_implemented" => Self::NotImplemented(detail),
            _ => Self::Remote(wire.error.clone()),
        }
    }
}

/// Serialized form of a [`RelayError`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub code: String,
    pub error: String,
    #[serde(default)]
    pub detail: String,
}
