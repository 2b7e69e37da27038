//! OCR engine adapter (OCR.space wire shape).
//!
//! Field extraction from the recognized text is delegated to an injected
//! [`FieldExtractor`]; this module only moves images and text around.

use super::traits::{Credentials, Integration, IntegrationError, IntegrationKind};
use crate::config::OcrConfig;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Turns recognized text into structured fields.
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Map<String, Value>;
}

/// Extractor that returns no fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFields;

impl FieldExtractor for NoFields {
    fn extract(&self, _text: &str) -> Map<String, Value> {
        Map::new()
    }
}

pub struct OcrIntegration {
    api_url: String,
    default_key: String,
    language: String,
    extractor: Arc<dyn FieldExtractor>,
    client: reqwest::Client,
}

impl OcrIntegration {
    pub fn new(
        config: &OcrConfig,
        extractor: Arc<dyn FieldExtractor>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api_url: config.api_url.clone(),
            default_key: config.api_key.clone(),
            language: config.language.clone(),
            extractor,
            client,
        }
    }

    fn parsed_text(body: &Value) -> Result<String, IntegrationError> {
        if body
            .get("IsErroredOnProcessing")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let message = match body.get("ErrorMessage") {
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; "),
                Some(Value::String(message)) => message.clone(),
                _ => "OCR processing failed".to_string(),
            };
            return Err(IntegrationError::Remote(message));
        }

        let text = body
            .get("ParsedResults")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| r.get("ParsedText").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok(text)
    }
}

#[async_trait]
impl Integration for OcrIntegration {
    fn kind(&self) -> IntegrationKind {
        IntegrationKind::Ocr
    }

    /// There is no handshake endpoint; a non-empty key is all a session needs.
    async fn connect(&self, params: &Value) -> Result<Credentials, IntegrationError> {
        let key = params
            .get("api_key")
            .and_then(Value::as_str)
            .unwrap_or(self.default_key.as_str())
            .trim();
        if key.is_empty() {
            return Err(IntegrationError::InvalidArgs("OCR API key is not configured".into()));
        }
        Ok(Credentials::with_token(key))
    }

    async fn health_check(&self, credentials: &Credentials) -> bool {
        credentials
            .token
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }

    async fn operate(
        &self,
        credentials: &Credentials,
        op: &str,
        args: &Value,
    ) -> Result<Value, IntegrationError> {
        if op != "recognize" {
            return Err(IntegrationError::UnsupportedOperation(op.to_string()));
        }
        let key = credentials
            .token
            .as_deref()
            .ok_or_else(|| IntegrationError::AuthExpired("no OCR API key".into()))?;

        let language = args
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or(self.language.as_str());
        let mut form = vec![
            ("apikey", key.to_string()),
            ("language", language.to_string()),
        ];
        if let Some(url) = args.get("image_url").and_then(Value::as_str) {
            form.push(("url", url.to_string()));
        } else if let Some(image) = args.get("image_base64").and_then(Value::as_str) {
            form.push(("base64Image", image.to_string()));
        } else {
            return Err(IntegrationError::InvalidArgs(
                "`image_url` or `image_base64` is required".into(),
            ));
        }

        let response = self.client.post(&self.api_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::from_status(status, &body));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| IntegrationError::Remote(format!("unparsable OCR reply: {e}")))?;

        let text = Self::parsed_text(&body)?;
        let fields = self.extractor.extract(&text);
        Ok(json!({ "text": text, "fields": fields }))
    }
}
