//! SMS gateway adapter.
//!
//! The gateway speaks a minimal JSON API: `GET /balance` and
//! `POST /send {to, text, from?}`, authenticated with a bearer API key.

use super::traits::{required_str, Credentials, Integration, IntegrationError, IntegrationKind};
use crate::config::SmsConfig;
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct SmsIntegration {
    api_url: String,
    default_key: String,
    sender: Option<String>,
    client: reqwest::Client,
}

impl SmsIntegration {
    pub fn new(config: &SmsConfig, client: reqwest::Client) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            default_key: config.api_key.clone(),
            sender: config.sender.clone(),
            client,
        }
    }

    async fn send_json(&self, request: reqwest::RequestBuilder) -> Result<Value, IntegrationError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::from_status(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| IntegrationError::Remote(format!("unparsable gateway reply: {e}")))
    }

    async fn balance(&self, key: &str) -> Result<Value, IntegrationError> {
        self.send_json(
            self.client
                .get(format!("{}/balance", self.api_url))
                .bearer_auth(key),
        )
        .await
    }
}

#[async_trait]
impl Integration for SmsIntegration {
    fn kind(&self) -> IntegrationKind {
        IntegrationKind::Sms
    }

    async fn connect(&self, params: &Value) -> Result<Credentials, IntegrationError> {
        let key = params
            .get("api_key")
            .and_then(Value::as_str)
            .unwrap_or(self.default_key.as_str())
            .trim()
            .to_string();
        if key.is_empty() {
            return Err(IntegrationError::InvalidArgs("SMS API key is not configured".into()));
        }
        let balance = self.balance(&key).await?;
        Ok(Credentials {
            token: Some(key),
            extra: json!({ "balance": balance.get("balance").cloned().unwrap_or(Value::Null) }),
            ..Credentials::default()
        })
    }

    async fn health_check(&self, credentials: &Credentials) -> bool {
        let Some(key) = credentials.token.as_deref() else {
            return false;
        };
        match self.balance(key).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("SMS health check failed: {e}");
                false
            }
        }
    }

    async fn operate(
        &self,
        credentials: &Credentials,
        op: &str,
        args: &Value,
    ) -> Result<Value, IntegrationError> {
        let key = credentials
            .token
            .as_deref()
            .ok_or_else(|| IntegrationError::AuthExpired("no SMS API key".into()))?;

        match op {
            "send" => {
                let to = required_str(args, "recipient")?;
                let text = required_str(args, "text")?;
                let mut body = json!({ "to": to, "text": text });
                if let Some(sender) = self.sender.as_deref() {
                    body["from"] = json!(sender);
                }
                self.send_json(
                    self.client
                        .post(format!("{}/send", self.api_url))
                        .bearer_auth(key)
                        .json(&body),
                )
                .await
            }
            "balance" => self.balance(key).await,
            other => Err(IntegrationError::UnsupportedOperation(other.to_string())),
        }
    }
}
