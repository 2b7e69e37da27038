//! Messaging bot adapter (Telegram Bot API).

use super::traits::{required_str, Credentials, Integration, IntegrationError, IntegrationKind};
use crate::config::BotConfig;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BotIntegration {
    api_base: String,
    default_token: String,
    client: reqwest::Client,
}

impl BotIntegration {
    pub fn new(config: &BotConfig, client: reqwest::Client) -> Self {
        Self {
            api_base: config.api_url.trim_end_matches('/').to_string(),
            default_token: config.bot_token.clone(),
            client,
        }
    }

    fn api_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{token}/{method}", self.api_base)
    }

    /// Bot API replies `{ok, result}` or `{ok:false, error_code, description}`.
    async fn call(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, IntegrationError> {
        let response = request.send().await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        let ok = body.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if status.is_success() && ok {
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description");
        Err(IntegrationError::from_status(status, description))
    }

    async fn get_me(&self, token: &str) -> Result<Value, IntegrationError> {
        self.call(self.client.get(self.api_url(token, "getMe"))).await
    }
}

#[async_trait]
impl Integration for BotIntegration {
    fn kind(&self) -> IntegrationKind {
        IntegrationKind::Bot
    }

    async fn connect(&self, params: &Value) -> Result<Credentials, IntegrationError> {
        let token = params
            .get("bot_token")
            .and_then(Value::as_str)
            .unwrap_or(self.default_token.as_str())
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(IntegrationError::InvalidArgs("bot token is not configured".into()));
        }

        let me = self.get_me(&token).await?;
        let username = me.get("username").and_then(Value::as_str).unwrap_or_default();
        tracing::info!(username, "Bot handshake succeeded");

        Ok(Credentials {
            token: Some(token),
            extra: json!({ "username": username }),
            ..Credentials::default()
        })
    }

    async fn health_check(&self, credentials: &Credentials) -> bool {
        let Some(token) = credentials.token.as_deref() else {
            return false;
        };
        match tokio::time::timeout(
            HEALTH_TIMEOUT,
            self.client.get(self.api_url(token, "getMe")).send(),
        )
        .await
        {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(e)) => {
                tracing::debug!("Bot health check failed: {e}");
                false
            }
            Err(_) => {
                tracing::debug!("Bot health check timed out after 5s");
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
        let token = credentials
            .token
            .as_deref()
            .ok_or_else(|| IntegrationError::AuthExpired("no bot token".into()))?;

        match op {
            "send" => {
                let chat_id = args
                    .get("chat_id")
                    .and_then(Value::as_str)
                    .map_or_else(|| required_str(args, "recipient"), Ok)?;
                let text = required_str(args, "text")?;
                let sent = self
                    .call(
                        self.client
                            .post(self.api_url(token, "sendMessage"))
                            .json(&json!({ "chat_id": chat_id, "text": text })),
                    )
                    .await?;
                Ok(json!({
                    "message_id": sent.get("message_id").cloned().unwrap_or(Value::Null),
                }))
            }
            "me" => self.get_me(token).await,
            other => Err(IntegrationError::UnsupportedOperation(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> BotIntegration {
        BotIntegration::new(
            &BotConfig {
                api_url: server.uri(),
                bot_token: "123:ABC".into(),
            },
            reqwest::Client::new(),
        )
    }

    #[test]
    fn api_url_embeds_token() {
        let bot = BotIntegration::new(
            &BotConfig {
                api_url: "https://api.telegram.org/".into(),
                bot_token: String::new(),
            },
            reqwest::Client::new(),
        );
        assert_eq!(
            bot.api_url("123:ABC", "getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[tokio::test]
    async fn connect_uses_configured_token_and_records_username() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bot123:ABC/getMe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": { "username": "switchboard_bot" }
            })))
            .mount(&server)
            .await;

        let credentials = adapter(&server).connect(&Value::Null).await.unwrap();
        assert_eq!(credentials.token.as_deref(), Some("123:ABC"));
        assert_eq!(credentials.extra_str("username"), Some("switchboard_bot"));
    }

    #[tokio::test]
    async fn send_posts_message_to_recipient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .and(body_partial_json(json!({ "chat_id": "42", "text": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": { "message_id": 7 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = adapter(&server)
            .operate(
                &Credentials::with_token("123:ABC"),
                "send",
                &json!({ "recipient": "42", "text": "hello" }),
            )
            .await
            .unwrap();
        assert_eq!(result["message_id"], 7);
    }

    #[tokio::test]
    async fn revoked_token_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bot123:ABC/getMe"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "ok": false,
                "error_code": 401,
                "description": "Unauthorized"
            })))
            .mount(&server)
            .await;

        let bot = adapter(&server);
        let err = bot.connect(&Value::Null).await.unwrap_err();
        assert!(err.is_auth());
        assert!(!bot.health_check(&Credentials::with_token("123:ABC")).await);
    }
}
