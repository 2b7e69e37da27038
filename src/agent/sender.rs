//! Outbound send by driving the chat client's composer.
//!
//! Attachment upload is not supported: a request carrying only attachments
//! fails with `NotImplemented`, and a request with text plus attachments sends
//! the text and lists the attachments as skipped in the result.

use super::dom::ChatSurface;
use super::phone;
use crate::config::AgentConfig;
use crate::protocol::{RelayError, SendMessageRequest};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub struct OutboundSender {
    surface: Arc<dyn ChatSurface>,
    country_prefix: String,
    input_timeout: Duration,
    poll: Duration,
}

impl OutboundSender {
    pub fn new(surface: Arc<dyn ChatSurface>, config: &AgentConfig) -> Self {
        Self {
            surface,
            country_prefix: config.default_country_prefix.clone(),
            input_timeout: config.input_timeout(),
            poll: config.ui_poll(),
        }
    }

    pub async fn send(&self, request: &SendMessageRequest) -> Result<Value, RelayError> {
        let text = request.text.trim();
        if text.is_empty() {
            if request.attachments.is_empty() {
                return Err(RelayError::InvalidRequest("nothing to send".into()));
            }
            return Err(RelayError::NotImplemented("attachment sending".into()));
        }

        let contact = phone::normalize(&request.contact_id, &self.country_prefix)?;
        if self.surface.current_conversation().await.as_deref() != Some(contact.as_str()) {
            tracing::debug!(contact = %contact, "Opening conversation");
            self.surface.open_conversation(&contact).await?;
        }

        self.wait_for_input().await?;
        self.surface.type_and_submit(text).await?;
        tracing::info!(contact = %contact, chars = text.chars().count(), "Message sent");

        let skipped: Vec<&str> = request.attachments.iter().map(|a| a.name.as_str()).collect();
        if !skipped.is_empty() {
            tracing::warn!(contact = %contact, count = skipped.len(), "Attachments skipped, sending them is not implemented");
        }
        Ok(json!({
            "sent": true,
            "contact_id": contact,
            "attachments_skipped": skipped,
        }))
    }

    async fn wait_for_input(&self) -> Result<(), RelayError> {
        let surface = Arc::clone(&self.surface);
        let poll = self.poll;
        tokio::time::timeout(self.input_timeout, async move {
            while !surface.input_ready().await {
                tokio::time::sleep(poll).await;
            }
        })
        .await
        .map_err(|_| RelayError::Timeout(self.input_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::dom::MemorySurface;
    use crate::protocol::Attachment;

    fn setup() -> (Arc<MemorySurface>, OutboundSender) {
        let surface = Arc::new(MemorySurface::new());
        surface.set_input_after(Some(0));
        let sender = OutboundSender::new(surface.clone(), &AgentConfig::default());
        (surface, sender)
    }

    fn request(contact: &str, text: &str) -> SendMessageRequest {
        SendMessageRequest {
            contact_id: contact.into(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn navigates_once_and_sends_to_normalized_contact() {
        let (surface, sender) = setup();
        let reply = sender.send(&request("999 123 45 67", "Hello")).await.unwrap();
        assert_eq!(reply["contact_id"], "79991234567");
        sender.send(&request("+79991234567", "Again")).await.unwrap();

        assert_eq!(surface.navigations(), ["79991234567"]);
        assert_eq!(
            surface.sent(),
            [
                ("79991234567".to_string(), "Hello".to_string()),
                ("79991234567".to_string(), "Again".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_composer_times_out() {
        let (surface, sender) = setup();
        surface.set_input_after(None);
        let err = sender.send(&request("79991234567", "hi")).await.unwrap_err();
        assert_eq!(err, RelayError::Timeout(Duration::from_secs(10)));
        assert!(surface.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn composer_appearing_late_is_waited_for() {
        let (surface, sender) = setup();
        surface.set_input_after(Some(3));
        sender.send(&request("79991234567", "hi")).await.unwrap();
        assert_eq!(surface.sent().len(), 1);
    }

    #[tokio::test]
    async fn attachments_only_is_not_implemented() {
        let (surface, sender) = setup();
        let mut req = request("79991234567", "");
        req.attachments.push(Attachment {
            name: "passport.jpg".into(),
            mime_type: Some("image/jpeg".into()),
            url: None,
        });
        assert!(matches!(
            sender.send(&req).await,
            Err(RelayError::NotImplemented(_))
        ));
        assert!(surface.navigations().is_empty());
    }

    #[tokio::test]
    async fn text_with_attachments_reports_them_skipped() {
        let (_surface, sender) = setup();
        let mut req = request("79991234567", "see attached");
        req.attachments.push(Attachment {
            name: "contract.pdf".into(),
            mime_type: None,
            url: None,
        });
        let reply = sender.send(&req).await.unwrap();
        assert_eq!(reply["attachments_skipped"], json!(["contract.pdf"]));
    }

    #[tokio::test]
    async fn submit_failure_is_returned() {
        let (surface, sender) = setup();
        surface.set_fail_submit(true);
        assert!(matches!(
            sender.send(&request("79991234567", "hi")).await,
            Err(RelayError::Remote(_))
        ));
    }
}
