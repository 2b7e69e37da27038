//! One bounded refresh-and-retry around an integration operation.
//!
//! An auth failure triggers exactly one `refresh_credentials` and, if that
//! succeeds, exactly one retry with the fresh credentials. Whatever the
//! retry returns is final.

use crate::integrations::{Credentials, Integration, IntegrationError};
use serde_json::Value;

#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<Value, IntegrationError>,
    /// Credentials obtained by the refresh, to be stored by the caller.
    pub refreshed: Option<Credentials>,
}

impl RetryOutcome {
    /// The credential is still rejected after everything we are allowed to try.
    pub fn credential_expired(&self) -> bool {
        matches!(self.result, Err(IntegrationError::AuthExpired(_)))
    }
}

pub async fn operate_with_refresh(
    integration: &dyn Integration,
    credentials: &Credentials,
    op: &str,
    args: &Value,
) -> RetryOutcome {
    let reason = match integration.operate(credentials, op, args).await {
        Err(IntegrationError::AuthExpired(reason)) => reason,
        other => {
            return RetryOutcome {
                result: other,
                refreshed: None,
            }
        }
    };

    let kind = integration.kind();
    tracing::info!(integration = %kind, op, "Credentials rejected ({reason}), refreshing once");

    let fresh = match integration.refresh_credentials(credentials).await {
        Ok(fresh) => fresh,
        Err(e) => {
            tracing::warn!(integration = %kind, "Credential refresh failed: {e}");
            return RetryOutcome {
                result: Err(IntegrationError::AuthExpired(e.to_string())),
                refreshed: None,
            };
        }
    };

    let retried = integration.operate(&fresh, op, args).await;
    if let Err(ref e) = retried {
        tracing::warn!(integration = %kind, op, "Retry after refresh failed: {e}");
    }
    RetryOutcome {
        result: retried,
        refreshed: Some(fresh),
    }
}
