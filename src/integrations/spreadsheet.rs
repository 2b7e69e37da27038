//! Spreadsheet service adapter (Google Sheets v4 wire shape).
//!
//! Handshake accepts an OAuth access token, or only a refresh token which is
//! exchanged first. `read` results are cacheable; every other operation
//! mutates the sheet and always goes to the network.

use super::traits::{required_str, Credentials, Integration, IntegrationError, IntegrationKind};
use crate::config::SpreadsheetConfig;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde_json::{json, Value};
use std::time::Duration;

pub struct SpreadsheetIntegration {
    api_url: String,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    default_spreadsheet: Option<String>,
    client: reqwest::Client,
}

impl SpreadsheetIntegration {
    pub fn new(config: &SpreadsheetConfig, client: reqwest::Client) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            default_spreadsheet: config.spreadsheet_id.clone(),
            client,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, IntegrationError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| IntegrationError::InvalidArgs(format!("bad api_url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| IntegrationError::InvalidArgs("api_url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn spreadsheet_id<'a>(
        &'a self,
        credentials: &'a Credentials,
        args: &'a Value,
    ) -> Result<&'a str, IntegrationError> {
        args.get("spreadsheet_id")
            .and_then(Value::as_str)
            .or_else(|| credentials.extra_str("spreadsheet_id"))
            .or(self.default_spreadsheet.as_deref())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| IntegrationError::InvalidArgs("missing `spreadsheet_id`".into()))
    }

    fn bearer(credentials: &Credentials) -> Result<&str, IntegrationError> {
        credentials
            .token
            .as_deref()
            .ok_or_else(|| IntegrationError::AuthExpired("no access token".into()))
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, IntegrationError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::from_status(status, &body));
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| IntegrationError::Remote(format!("unparsable response: {e}")))
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Credentials, IntegrationError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = self.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self.client.post(&self.token_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // A rejected refresh token is terminal for this session.
            return Err(IntegrationError::AuthExpired(format!(
                "token refresh failed: {status}: {}",
                crate::util::truncate_with_ellipsis(body.trim(), 200)
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| IntegrationError::Remote(format!("unparsable token response: {e}")))?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| IntegrationError::Remote("token response without access_token".into()))?;
        let expires_at = body
            .get("expires_in")
            .and_then(Value::as_u64)
            .and_then(|secs| chrono::Duration::from_std(Duration::from_secs(secs)).ok())
            .map(|ttl| Utc::now() + ttl);

        Ok(Credentials {
            token: Some(access_token.to_string()),
            refresh_token: Some(refresh_token.to_string()),
            expires_at,
            extra: Value::Null,
        })
    }

    async fn verify(&self, token: &str, spreadsheet_id: &str) -> Result<(), IntegrationError> {
        let mut url = self.url(&["spreadsheets", spreadsheet_id])?;
        url.query_pairs_mut().append_pair("fields", "spreadsheetId");
        self.send_json(self.client.get(url).bearer_auth(token))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Integration for SpreadsheetIntegration {
    fn kind(&self) -> IntegrationKind {
        IntegrationKind::Spreadsheet
    }

    async fn connect(&self, params: &Value) -> Result<Credentials, IntegrationError> {
        let access_token = params.get("access_token").and_then(Value::as_str);
        let refresh_token = params.get("refresh_token").and_then(Value::as_str);

        let mut credentials = match (access_token, refresh_token) {
            (Some(token), refresh) => Credentials {
                token: Some(token.to_string()),
                refresh_token: refresh.map(str::to_string),
                ..Credentials::default()
            },
            (None, Some(refresh)) => self.exchange_refresh_token(refresh).await?,
            (None, None) => {
                return Err(IntegrationError::InvalidArgs(
                    "`access_token` or `refresh_token` is required".into(),
                ))
            }
        };

        let spreadsheet_id = params
            .get("spreadsheet_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.default_spreadsheet.clone());
        if let (Some(id), Some(token)) = (spreadsheet_id.as_deref(), credentials.token.as_deref()) {
            self.verify(token, id).await?;
        }
        if let Some(id) = spreadsheet_id {
            credentials.extra = json!({ "spreadsheet_id": id });
        }
        Ok(credentials)
    }

    async fn health_check(&self, credentials: &Credentials) -> bool {
        let Some(token) = credentials.token.as_deref() else {
            return false;
        };
        let Ok(id) = self.spreadsheet_id(credentials, &Value::Null) else {
            // Nothing to probe against; the token itself is all we have.
            return true;
        };
        match self.verify(token, id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Spreadsheet health check failed: {e}");
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
        let token = Self::bearer(credentials)?;

        if op == "create" {
            let title = args
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("Untitled");
            let url = self.url(&["spreadsheets"])?;
            let created = self
                .send_json(
                    self.client
                        .post(url)
                        .bearer_auth(token)
                        .json(&json!({ "properties": { "title": title } })),
                )
                .await?;
            return Ok(json!({
                "spreadsheet_id": created.get("spreadsheetId").cloned().unwrap_or(Value::Null),
                "url": created.get("spreadsheetUrl").cloned().unwrap_or(Value::Null),
            }));
        }

        let id = self.spreadsheet_id(credentials, args)?;
        let range = required_str(args, "range")?;
        let values = args.get("values").cloned().unwrap_or_else(|| json!([]));

        match op {
            "read" => {
                let url = self.url(&["spreadsheets", id, "values", range])?;
                let body = self
                    .send_json(self.client.get(url).bearer_auth(token))
                    .await?;
                Ok(json!({
                    "range": body.get("range").cloned().unwrap_or_else(|| json!(range)),
                    "values": body.get("values").cloned().unwrap_or_else(|| json!([])),
                }))
            }
            "write" => {
                let mut url = self.url(&["spreadsheets", id, "values", range])?;
                url.query_pairs_mut()
                    .append_pair("valueInputOption", "USER_ENTERED");
                self.send_json(
                    self.client
                        .put(url)
                        .bearer_auth(token)
                        .json(&json!({ "range": range, "values": values })),
                )
                .await
            }
            "append" => {
                let segment = format!("{range}:append");
                let mut url = self.url(&["spreadsheets", id, "values", &segment])?;
                url.query_pairs_mut()
                    .append_pair("valueInputOption", "USER_ENTERED")
                    .append_pair("insertDataOption", "INSERT_ROWS");
                self.send_json(
                    self.client
                        .post(url)
                        .bearer_auth(token)
                        .json(&json!({ "range": range, "values": values })),
                )
                .await
            }
            "clear" => {
                let segment = format!("{range}:clear");
                let url = self.url(&["spreadsheets", id, "values", &segment])?;
                self.send_json(self.client.post(url).bearer_auth(token).json(&json!({})))
                    .await
            }
            other => Err(IntegrationError::UnsupportedOperation(other.to_string())),
        }
    }

    async fn refresh_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Credentials, IntegrationError> {
        let refresh_token = credentials
            .refresh_token
            .as_deref()
            .ok_or_else(|| IntegrationError::AuthExpired("no refresh token".into()))?;
        let mut fresh = self.exchange_refresh_token(refresh_token).await?;
        fresh.extra = credentials.extra.clone();
        Ok(fresh)
    }

    fn cacheable(&self, op: &str) -> bool {
        op == "read"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> SpreadsheetIntegration {
        SpreadsheetIntegration::new(
            &SpreadsheetConfig {
                api_url: server.uri(),
                token_url: format!("{}/token", server.uri()),
                client_id: "client".into(),
                client_secret: Some("secret".into()),
                spreadsheet_id: Some("sheet-1".into()),
            },
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn read_returns_values_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/spreadsheets/sheet-1/values/A1:B2"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "range": "A1:B2",
                "values": [["a", "b"], ["c", "d"]]
            })))
            .mount(&server)
            .await;

        let sheets = adapter(&server);
        let result = sheets
            .operate(
                &Credentials::with_token("tok"),
                "read",
                &json!({ "range": "A1:B2" }),
            )
            .await
            .unwrap();
        assert_eq!(result["values"][1][0], "c");
        assert!(sheets.cacheable("read"));
        assert!(!sheets.cacheable("append"));
    }

    #[tokio::test]
    async fn unauthorized_is_classified_as_auth_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/spreadsheets/sheet-1/values/A1:append"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .operate(
                &Credentials::with_token("stale"),
                "append",
                &json!({ "range": "A1", "values": [["x"]] }),
            )
            .await
            .unwrap_err();
        assert!(err.is_auth(), "{err}");
    }

    #[tokio::test]
    async fn refresh_exchanges_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let old = Credentials {
            token: Some("stale".into()),
            refresh_token: Some("r-1".into()),
            expires_at: None,
            extra: json!({ "spreadsheet_id": "sheet-9" }),
        };
        let fresh = adapter(&server).refresh_credentials(&old).await.unwrap();
        assert_eq!(fresh.token.as_deref(), Some("fresh"));
        assert_eq!(fresh.refresh_token.as_deref(), Some("r-1"));
        assert!(fresh.expires_at.is_some());
        assert_eq!(fresh.extra_str("spreadsheet_id"), Some("sheet-9"));
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_fails_fast() {
        let server = MockServer::start().await;
        let err = adapter(&server)
            .refresh_credentials(&Credentials::with_token("only-access"))
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn connect_verifies_spreadsheet() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/spreadsheets/sheet-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "spreadsheetId": "sheet-1" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let credentials = adapter(&server)
            .connect(&json!({ "access_token": "tok", "refresh_token": "r" }))
            .await
            .unwrap();
        assert_eq!(credentials.token.as_deref(), Some("tok"));
        assert_eq!(credentials.extra_str("spreadsheet_id"), Some("sheet-1"));
    }

    #[tokio::test]
    async fn unknown_op_is_unsupported() {
        let server = MockServer::start().await;
        let err = adapter(&server)
            .operate(
                &Credentials::with_token("tok"),
                "pivot",
                &json!({ "range": "A1" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err, IntegrationError::UnsupportedOperation("pivot".into()));
    }
}
