//! External services the Hub holds sessions for.
//!
//! Each adapter implements [`Integration`] from [`traits`]. Adapters are
//! instantiated by [`build_integrations`] based on the `[integrations.*]`
//! config sections; the chat automation adapter is always present because
//! its "remote side" is the Agent link rather than a configured endpoint.

pub mod bot;
pub mod chat;
pub mod ocr;
pub mod sms;
pub mod spreadsheet;
pub mod traits;

pub use bot::BotIntegration;
pub use chat::{AgentLink, ChatIntegration};
pub use ocr::{FieldExtractor, NoFields, OcrIntegration};
pub use sms::SmsIntegration;
pub use spreadsheet::SpreadsheetIntegration;
pub use traits::{Credentials, Integration, IntegrationError, IntegrationKind};

use crate::config::IntegrationsConfig;
use std::sync::Arc;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared HTTP client for every adapter.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {e}");
            reqwest::Client::new()
        })
}

/// Instantiate every configured adapter plus the chat automation link.
pub fn build_integrations(
    config: &IntegrationsConfig,
    agent: Arc<AgentLink>,
    extractor: Arc<dyn FieldExtractor>,
) -> Vec<Arc<dyn Integration>> {
    let client = http_client();
    let mut integrations: Vec<Arc<dyn Integration>> = vec![Arc::new(ChatIntegration::new(agent))];

    if let Some(ref sheets) = config.spreadsheet {
        integrations.push(Arc::new(SpreadsheetIntegration::new(sheets, client.clone())));
    }
    if let Some(ref bot) = config.bot {
        integrations.push(Arc::new(BotIntegration::new(bot, client.clone())));
    }
    if let Some(ref sms) = config.sms {
        integrations.push(Arc::new(SmsIntegration::new(sms, client.clone())));
    }
    if let Some(ref ocr) = config.ocr {
        integrations.push(Arc::new(OcrIntegration::new(ocr, extractor, client)));
    }

    let names: Vec<&str> = integrations.iter().map(|i| i.kind().as_str()).collect();
    tracing::info!(integrations = ?names, "Integrations configured");
    integrations
}
