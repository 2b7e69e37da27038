pub mod schema;

#[allow(unused_imports)]
pub use schema::{
    AgentConfig, BotConfig, BridgeConfig, CacheConfig, Config, HubConfig, IntegrationsConfig,
    OcrConfig, SchedulerConfig, SmsConfig, SpreadsheetConfig,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_config_default_is_constructible() {
        let config = Config::default();

        assert!(config.bridge.call_timeout_secs > 0);
        assert!(!config.hub.allowed_origins.is_empty());
        assert!(config.integrations.spreadsheet.is_none());
    }

    #[test]
    fn reexported_integration_configs_are_constructible() {
        let bot = BotConfig {
            api_url: "https://api.telegram.org".into(),
            bot_token: "token".into(),
        };
        let sms = SmsConfig {
            api_url: "https://sms.example.com".into(),
            api_key: "key".into(),
            sender: None,
        };

        assert_eq!(bot.bot_token, "token");
        assert_eq!(sms.api_key, "key");
    }
}
