use anyhow::{Context, Result};
use chrono::NaiveTime;
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const CONFIG_FILE: &str = "config.toml";
const HUB_STATE_FILE: &str = "hub_state.json";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level switchboard configuration, loaded from `config.toml`.
///
/// Resolution order: `--config-dir` / `SWITCHBOARD_CONFIG_DIR` env → `~/.switchboard/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Page-side Bridge settings (`[bridge]`).
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Hub listeners and caller allow-list (`[hub]`).
    #[serde(default)]
    pub hub: HubConfig,

    /// Hub response cache (`[cache]`).
    #[serde(default)]
    pub cache: CacheConfig,

    /// Hub periodic tasks (`[scheduler]`).
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Chat automation agent timing and silence rules (`[agent]`).
    #[serde(default)]
    pub agent: AgentConfig,

    /// External service endpoints and credentials (`[integrations.*]`).
    #[serde(default)]
    pub integrations: IntegrationsConfig,
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir().unwrap_or_else(|_| PathBuf::from(".switchboard"));
        Self {
            config_path: config_dir.join(CONFIG_FILE),
            bridge: BridgeConfig::default(),
            hub: HubConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            agent: AgentConfig::default(),
            integrations: IntegrationsConfig::default(),
        }
    }
}

// ── Bridge ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BridgeConfig {
    /// Budget for a single correlated call. Default: `30`.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Liveness probe cadence. Default: `5`.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Origin stamped on every call. An in-process Hub checks it; a socket
    /// listener checks the peer address instead.
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Hub address dialed by `switchboard call`.
    #[serde(default = "default_listen_addr")]
    pub hub_addr: String,
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_probe_interval_secs() -> u64 {
    5
}

fn default_origin() -> String {
    "app://switchboard".into()
}

fn default_listen_addr() -> String {
    "127.0.0.1:7878".into()
}

fn default_agent_listen_addr() -> String {
    "127.0.0.1:7879".into()
}

impl BridgeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            origin: default_origin(),
            hub_addr: default_listen_addr(),
        }
    }
}

// ── Hub ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HubConfig {
    /// Listener for page connections.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Listener for the chat automation agent.
    #[serde(default = "default_agent_listen_addr")]
    pub agent_listen_addr: String,
    /// Origins allowed to call the Hub. `"*"` allows any; `scheme://host:*` any port.
    /// Socket pages are identified as `tcp://<peer address>`.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Budget for Hub→Agent calls (handshake, send). Default: `30`.
    #[serde(default = "default_call_timeout_secs")]
    pub agent_call_timeout_secs: u64,
}

fn default_allowed_origins() -> Vec<String> {
    vec![default_origin(), "tcp://127.0.0.1:*".into()]
}

impl HubConfig {
    pub fn agent_call_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_call_timeout_secs)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            agent_listen_addr: default_agent_listen_addr(),
            allowed_origins: default_allowed_origins(),
            agent_call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

// ── Cache ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheConfig {
    /// Entries older than this are evicted by the sweep. Default: `300`.
    #[serde(default = "default_cache_max_age_secs")]
    pub max_age_secs: u64,
    /// Hard cap on entries; oldest evicted first. Default: `512`.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_cache_max_age_secs() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    512
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_cache_max_age_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────────

/// Hub periodic task cadence (`[scheduler]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerConfig {
    /// Session health sweep cadence. Default: `300`.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Cache sweep cadence. Default: `60`.
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,
    /// Outbox drain cadence. Default: `10`.
    #[serde(default = "default_queue_drain_interval_secs")]
    pub queue_drain_interval_secs: u64,
    /// Pause between two outbox items (rate limiting). Default: `1500`.
    #[serde(default = "default_queue_item_delay_ms")]
    pub queue_item_delay_ms: u64,
    /// Delivery attempts per outbox item before it is dropped. Default: `3`.
    #[serde(default = "default_queue_max_attempts")]
    pub queue_max_attempts: u32,
}

fn default_health_interval_secs() -> u64 {
    300
}

fn default_cache_sweep_interval_secs() -> u64 {
    60
}

fn default_queue_drain_interval_secs() -> u64 {
    10
}

fn default_queue_item_delay_ms() -> u64 {
    1500
}

fn default_queue_max_attempts() -> u32 {
    3
}

impl SchedulerConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    pub fn queue_drain_interval(&self) -> Duration {
        Duration::from_secs(self.queue_drain_interval_secs)
    }

    pub fn queue_item_delay(&self) -> Duration {
        Duration::from_millis(self.queue_item_delay_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
            queue_drain_interval_secs: default_queue_drain_interval_secs(),
            queue_item_delay_ms: default_queue_item_delay_ms(),
            queue_max_attempts: default_queue_max_attempts(),
        }
    }
}

// ── Agent ─────────────────────────────────────────────────────────

/// Chat automation agent (`[agent]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    /// Upper bound on waiting for the host page's markers. Default: `30`.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// Upper bound on waiting for the message input. Default: `10`.
    #[serde(default = "default_input_timeout_secs")]
    pub input_timeout_secs: u64,
    /// Poll step for the bounded UI waits. Default: `250`.
    #[serde(default = "default_ui_poll_ms")]
    pub ui_poll_ms: u64,
    /// Prefix added to bare 10-digit numbers. Default: `"7"`.
    #[serde(default = "default_country_prefix")]
    pub default_country_prefix: String,
    /// Inactivity after which a contact counts as silent. Default: `8`.
    #[serde(default = "default_silence_threshold_hours")]
    pub silence_threshold_hours: u64,
    /// Local time of day (`HH:MM`) from which silent contacts are escalated. Default: `"18:30"`.
    #[serde(default = "default_transfer_cutoff")]
    pub transfer_cutoff: String,
    /// Silence sweep cadence. Default: `30`.
    #[serde(default = "default_sweep_interval_mins")]
    pub sweep_interval_mins: u64,
    /// Delay before the first sweep. Default: `60`.
    #[serde(default = "default_first_sweep_delay_secs")]
    pub first_sweep_delay_secs: u64,
    /// IANA timezone for the cutoff (e.g. `"Europe/Moscow"`); host local time when unset.
    #[serde(default)]
    pub timezone: Option<String>,
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_input_timeout_secs() -> u64 {
    10
}

fn default_ui_poll_ms() -> u64 {
    250
}

fn default_country_prefix() -> String {
    "7".into()
}

fn default_silence_threshold_hours() -> u64 {
    8
}

fn default_transfer_cutoff() -> String {
    "18:30".into()
}

fn default_sweep_interval_mins() -> u64 {
    30
}

fn default_first_sweep_delay_secs() -> u64 {
    60
}

impl AgentConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_secs(self.input_timeout_secs)
    }

    pub fn ui_poll(&self) -> Duration {
        Duration::from_millis(self.ui_poll_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_mins * 60)
    }

    pub fn first_sweep_delay(&self) -> Duration {
        Duration::from_secs(self.first_sweep_delay_secs)
    }

    pub fn transfer_cutoff_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.transfer_cutoff.trim(), "%H:%M").with_context(|| {
            format!(
                "agent.transfer_cutoff must be HH:MM, got {:?}",
                self.transfer_cutoff
            )
        })
    }

    pub fn timezone(&self) -> Result<Option<chrono_tz::Tz>> {
        match self.timezone.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(name) => name
                .parse::<chrono_tz::Tz>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("agent.timezone {name:?} is invalid: {e}")),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout_secs(),
            input_timeout_secs: default_input_timeout_secs(),
            ui_poll_ms: default_ui_poll_ms(),
            default_country_prefix: default_country_prefix(),
            silence_threshold_hours: default_silence_threshold_hours(),
            transfer_cutoff: default_transfer_cutoff(),
            sweep_interval_mins: default_sweep_interval_mins(),
            first_sweep_delay_secs: default_first_sweep_delay_secs(),
            timezone: None,
        }
    }
}

// ── Integrations ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct IntegrationsConfig {
    #[serde(default)]
    pub spreadsheet: Option<SpreadsheetConfig>,
    #[serde(default)]
    pub bot: Option<BotConfig>,
    #[serde(default)]
    pub sms: Option<SmsConfig>,
    #[serde(default)]
    pub ocr: Option<OcrConfig>,
}

/// Spreadsheet service (`[integrations.spreadsheet]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SpreadsheetConfig {
    #[serde(default = "default_sheets_api_url")]
    pub api_url: String,
    /// OAuth token endpoint used for the refresh-token grant.
    #[serde(default = "default_sheets_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub client_id: String,
    /// Overridden by `SWITCHBOARD_SHEETS_CLIENT_SECRET`.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Spreadsheet used when a call does not name one.
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
}

fn default_sheets_api_url() -> String {
    "https://sheets.googleapis.com/v4".into()
}

fn default_sheets_token_url() -> String {
    "https://oauth2.googleapis.com/token".into()
}

/// Messaging bot (`[integrations.bot]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BotConfig {
    #[serde(default = "default_bot_api_url")]
    pub api_url: String,
    /// Overridden by `SWITCHBOARD_BOT_TOKEN`.
    #[serde(default)]
    pub bot_token: String,
}

fn default_bot_api_url() -> String {
    "https://api.telegram.org".into()
}

/// SMS gateway (`[integrations.sms]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SmsConfig {
    pub api_url: String,
    /// Overridden by `SWITCHBOARD_SMS_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub sender: Option<String>,
}

/// OCR engine (`[integrations.ocr]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_api_url")]
    pub api_url: String,
    /// Overridden by `SWITCHBOARD_OCR_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_ocr_language")]
    pub language: String,
}

fn default_ocr_api_url() -> String {
    "https://api.ocr.space/parse/image".into()
}

fn default_ocr_language() -> String {
    "rus".into()
}

// ── Loading & saving ──────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".switchboard"))
}

fn resolve_config_dir() -> Result<PathBuf> {
    match std::env::var("SWITCHBOARD_CONFIG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir.trim())),
        _ => default_config_dir(),
    }
}

impl Config {
    /// Load `config.toml` from the resolved config directory, writing the
    /// defaults first when it does not exist yet.
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = resolve_config_dir()?;
        Self::load_or_init_at(&config_dir.join(CONFIG_FILE)).await
    }

    pub async fn load_or_init_at(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.to_path_buf();
            config.apply_env_overrides();
            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                initialized = false,
                "Config loaded"
            );
            Ok(config)
        } else {
            let mut config = Config {
                config_path: config_path.to_path_buf(),
                ..Config::default()
            };
            config.save().await?;

            // Restrict permissions on newly created config file (may contain API keys)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(config_path, Permissions::from_mode(0o600)).await;
            }

            config.apply_env_overrides();
            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                initialized = true,
                "Config loaded"
            );
            Ok(config)
        }
    }

    /// Persisted Hub state lives next to the config file.
    pub fn state_path(&self) -> PathBuf {
        self.config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
            .join(HUB_STATE_FILE)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.bridge.call_timeout_secs == 0 {
            anyhow::bail!("bridge.call_timeout_secs must be greater than 0");
        }
        if self.bridge.probe_interval_secs == 0 {
            anyhow::bail!("bridge.probe_interval_secs must be greater than 0");
        }
        if self.bridge.origin.trim().is_empty() {
            anyhow::bail!("bridge.origin must not be empty");
        }

        if self.hub.allowed_origins.is_empty() {
            anyhow::bail!("hub.allowed_origins must not be empty");
        }
        for (i, origin) in self.hub.allowed_origins.iter().enumerate() {
            if origin.trim().is_empty() {
                anyhow::bail!("hub.allowed_origins[{i}] must not be empty");
            }
        }
        if self.hub.agent_call_timeout_secs == 0 {
            anyhow::bail!("hub.agent_call_timeout_secs must be greater than 0");
        }

        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be greater than 0");
        }

        let scheduler = &self.scheduler;
        for (name, value) in [
            ("scheduler.health_interval_secs", scheduler.health_interval_secs),
            (
                "scheduler.cache_sweep_interval_secs",
                scheduler.cache_sweep_interval_secs,
            ),
            (
                "scheduler.queue_drain_interval_secs",
                scheduler.queue_drain_interval_secs,
            ),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than 0");
            }
        }
        if scheduler.queue_max_attempts == 0 {
            anyhow::bail!("scheduler.queue_max_attempts must be greater than 0");
        }

        if self.agent.sweep_interval_mins == 0 {
            anyhow::bail!("agent.sweep_interval_mins must be greater than 0");
        }
        if self.agent.silence_threshold_hours == 0 {
            anyhow::bail!("agent.silence_threshold_hours must be greater than 0");
        }
        if !self
            .agent
            .default_country_prefix
            .chars()
            .all(|c| c.is_ascii_digit())
        {
            anyhow::bail!("agent.default_country_prefix must contain digits only");
        }
        self.agent.transfer_cutoff_time()?;
        self.agent.timezone()?;

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = non_empty_env("SWITCHBOARD_BOT_TOKEN") {
            self.integrations
                .bot
                .get_or_insert_with(|| BotConfig {
                    api_url: default_bot_api_url(),
                    bot_token: String::new(),
                })
                .bot_token = token;
        }
        if let Some(key) = non_empty_env("SWITCHBOARD_SMS_API_KEY") {
            if let Some(sms) = self.integrations.sms.as_mut() {
                sms.api_key = key;
            }
        }
        if let Some(key) = non_empty_env("SWITCHBOARD_OCR_API_KEY") {
            self.integrations
                .ocr
                .get_or_insert_with(|| OcrConfig {
                    api_url: default_ocr_api_url(),
                    api_key: String::new(),
                    language: default_ocr_language(),
                })
                .api_key = key;
        }
        if let Some(secret) = non_empty_env("SWITCHBOARD_SHEETS_CLIENT_SECRET") {
            if let Some(sheets) = self.integrations.spreadsheet.as_mut() {
                sheets.client_secret = Some(secret);
            }
        }
    }

    /// Copy with every credential replaced by a mask, for display.
    pub fn redacted(&self) -> Self {
        const MASK: &str = "***";
        let mut copy = self.clone();
        if let Some(bot) = copy.integrations.bot.as_mut() {
            if !bot.bot_token.is_empty() {
                bot.bot_token = MASK.into();
            }
        }
        if let Some(sms) = copy.integrations.sms.as_mut() {
            if !sms.api_key.is_empty() {
                sms.api_key = MASK.into();
            }
        }
        if let Some(ocr) = copy.integrations.ocr.as_mut() {
            if !ocr.api_key.is_empty() {
                ocr.api_key = MASK.into();
            }
        }
        if let Some(sheets) = copy.integrations.spreadsheet.as_mut() {
            if sheets.client_secret.is_some() {
                sheets.client_secret = Some(MASK.into());
            }
        }
        copy
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        crate::util::write_atomic(&self.config_path, toml_str.as_bytes()).await
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
