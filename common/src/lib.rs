/*!
common/src/lib.rs

Shared configuration types for Briefing.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader for a TOML config file, with default + override merging
- Small helpers the scheduler and the agents use to interpret configuration
*/

use anyhow::{Context, Result};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Language model backend (any OpenAI-compatible endpoint, Ollama by default)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible API, e.g. "http://localhost:11434/v1"
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    /// Overall timeout for one completion request
    pub timeout_seconds: u64,
    /// Timeout for the liveness probe; keep this short so a down backend fails fast
    pub health_timeout_seconds: u64,
    /// Retries on connection/timeout failures (total attempts = max_retries + 1)
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Name of the env var holding an API key; local backends need none
    pub api_key_env: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "gemma3".to_string(),
            temperature: 0.2,
            max_tokens: 2048,
            timeout_seconds: 120,
            health_timeout_seconds: 5,
            max_retries: 2,
            retry_base_delay_ms: 1000,
            api_key_env: None,
        }
    }
}

/// Dedup ledger location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub path: String,
    pub max_ids: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: "data/history.json".to_string(),
            max_ids: 5000,
        }
    }
}

/// Shortcuts bridge: a small local HTTP service that runs named shortcuts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub url: String,
    pub token_env: String,
    pub text_shortcut: String,
    pub notification_shortcut: String,
    pub reminder_shortcut: String,
    pub timeout_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9876".to_string(),
            token_env: "SHORTCUTS_BRIDGE_TOKEN".to_string(),
            text_shortcut: "SendText".to_string(),
            notification_shortcut: "ShowNotification".to_string(),
            reminder_shortcut: "CreateReminder".to_string(),
            timeout_seconds: 30,
        }
    }
}

/// SMTP settings. Credentials are read from the named env vars at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub sender_env: String,
    pub recipient_env: String,
    pub password_env: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            sender_env: "EMAIL_SENDER".to_string(),
            recipient_env: "EMAIL_RECIPIENT".to_string(),
            password_env: "GMAIL_APP_PASSWORD".to_string(),
        }
    }
}

/// SMS fallback for text delivery (Twilio-compatible REST API)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub api_base: String,
    pub account_sid_env: String,
    pub auth_token_env: String,
    pub from_env: String,
    pub to_env: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.twilio.com".to_string(),
            account_sid_env: "TWILIO_ACCOUNT_SID".to_string(),
            auth_token_env: "TWILIO_AUTH_TOKEN".to_string(),
            from_env: "TWILIO_FROM_NUMBER".to_string(),
            to_env: "TWILIO_TO_NUMBER".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub drafts_dir: String,
    pub bridge: BridgeConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            drafts_dir: "data/drafts".to_string(),
            bridge: BridgeConfig::default(),
            email: EmailConfig::default(),
            sms: SmsConfig::default(),
        }
    }
}

/// Delivery channels an agent may fan out to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Text,
    Email,
    File,
    Notification,
    Reminder,
}

/// Wall-clock schedule for one agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local times in "HH:MM" 24h format
    pub times: Vec<String>,
    /// Weekday filter ("mon", "tue", ...). Empty means every day.
    pub days: Vec<String>,
}

impl ScheduleConfig {
    /// True when `hhmm` is one of the configured times and `weekday` passes the day filter.
    pub fn is_due(&self, weekday: Weekday, hhmm: &str) -> bool {
        let day_ok = self.days.is_empty()
            || self
                .days
                .iter()
                .filter_map(|d| d.trim().parse::<Weekday>().ok())
                .any(|d| d == weekday);
        day_ok && self.times.iter().any(|t| normalize_hhmm(t).as_deref() == Some(hhmm))
    }
}

/// Normalize "6:30" / "06:30" / " 06:30 " to "06:30". Returns None for malformed times.
pub fn normalize_hhmm(raw: &str) -> Option<String> {
    let (h, m) = raw.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(format!("{:02}:{:02}", h, m))
}

/// Per-agent settings (`[agents.<name>]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub enabled: bool,
    pub max_items: usize,
    pub delivery: Vec<DeliveryMethod>,
    pub schedule: Option<ScheduleConfig>,
    /// email_triage: command (argv) printing a JSON array of messages on stdout
    pub mail_command: Vec<String>,
    /// email_triage: mailbox label handed to the command as its last argument
    pub label: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_items: 10,
            delivery: Vec::new(),
            schedule: None,
            mail_command: Vec::new(),
            label: "AI-REVIEW".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn delivers_via(&self, method: DeliveryMethod) -> bool {
        self.delivery.contains(&method)
    }
}

/// Simple feed descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiteratureSources {
    pub search_terms: Vec<String>,
    pub arxiv_categories: Vec<String>,
    pub biorxiv_subjects: Vec<String>,
}

impl Default for LiteratureSources {
    fn default() -> Self {
        Self {
            search_terms: Vec::new(),
            arxiv_categories: vec!["cs.AI".into(), "cs.CL".into(), "cs.LG".into()],
            biorxiv_subjects: vec!["bioinformatics".into()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsSources {
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NihSources {
    pub activity_codes: Vec<String>,
    pub ic_codes: Vec<String>,
    pub fiscal_years: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantsGovSources {
    pub feed_url: String,
}

impl Default for GrantsGovSources {
    fn default() -> Self {
        Self {
            feed_url: "https://www.grants.gov/rss/GG_NewOppByCategory.xml".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantsSources {
    pub search_terms: Vec<String>,
    pub nih: NihSources,
    pub grants_gov: GrantsGovSources,
}

/// One current-events topic. Topics are an array of tables so their order is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    pub item_hint: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaywalledSite {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentEventsSources {
    pub topics: Vec<TopicConfig>,
    pub paywalled: Vec<PaywalledSite>,
    /// Exported browser storage state used to authenticate paywalled fetches
    pub cookie_file: String,
}

impl Default for CurrentEventsSources {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            paywalled: Vec::new(),
            cookie_file: "data/browser_auth.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub literature: LiteratureSources,
    pub news: NewsSources,
    pub grants: GrantsSources,
    pub current_events: CurrentEventsSources,
}

/// Telegram front end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token_env: String,
    pub allowed_chat_ids_env: String,
    /// Conversation turns kept per chat (user + assistant = one turn)
    pub max_history: usize,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token_env: "TELEGRAM_BOT_TOKEN".to_string(),
            allowed_chat_ids_env: "TELEGRAM_ALLOWED_CHAT_IDS".to_string(),
            max_history: 20,
            temperature: None,
            system_prompt: None,
        }
    }
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub history: HistoryConfig,
    pub delivery: DeliveryConfig,
    pub agents: BTreeMap<String, AgentConfig>,
    pub sources: SourcesConfig,
    pub telegram: TelegramConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Settings for one agent; agents missing from the file get defaults.
    pub fn agent(&self, name: &str) -> AgentConfig {
        self.agents.get(name).cloned().unwrap_or_default()
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}
