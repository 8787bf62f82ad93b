//! Configuration loader and validator for the candidate mail bot.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::IntentLabel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub gmail: Gmail,
    pub crm: Crm,
    pub classifier: Classifier,
}

/// App-level settings: polling, batching and retry bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub max_attempts: u32,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default = "default_adapter_timeout")]
    pub adapter_timeout_secs: u64,
    #[serde(default = "default_lease")]
    pub lease_seconds: u64,
}

fn default_workers() -> u32 {
    4
}

fn default_adapter_timeout() -> u64 {
    30
}

fn default_lease() -> u64 {
    300
}

/// Gmail REST API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gmail {
    pub access_token: String,
    #[serde(default = "default_gmail_user")]
    pub user_id: String,
    pub query: String,
    /// Label added once a message reaches a final record; UNREAD is always removed.
    #[serde(default)]
    pub processed_label_id: Option<String>,
    /// Gmail label id added per classified intent, e.g. `Scheduling: Label_12`.
    #[serde(default)]
    pub intent_label_ids: BTreeMap<IntentLabel, String>,
}

fn default_gmail_user() -> String {
    "me".to_string()
}

/// Candidate lookup: either a CRM HTTP endpoint or a local roster file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Crm {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub roster_path: Option<String>,
}

/// Language model settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classifier {
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_classifier_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Results below this confidence are recorded as Unknown and never sent.
    #[serde(default)]
    pub min_confidence: Option<f32>,
}

fn default_classifier_url() -> String {
    "https://api.openai.com/".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

impl App {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    /// Default SQLite URL under the data dir; `DATABASE_URL` wins when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/mailbot.db", self.data_dir))
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        self.app.database_url()
    }

    /// Secrets may be injected from the environment instead of the YAML file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("GMAIL_ACCESS_TOKEN") {
            self.gmail.access_token = token;
        }
        if let Ok(token) = std::env::var("CRM_API_TOKEN") {
            self.crm.api_token = Some(token);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.classifier.api_key = key;
        }
    }
}

/// Load configuration from a YAML file, apply env overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.batch_size == 0 {
        return Err(ConfigError::Invalid("app.batch_size must be > 0"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }
    if cfg.app.adapter_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.adapter_timeout_secs must be > 0"));
    }
    // One message spans resolve, classify, send and the store writes, each
    // bounded by the adapter timeout.
    if cfg.app.lease_seconds <= cfg.app.adapter_timeout_secs.saturating_mul(4) {
        return Err(ConfigError::Invalid(
            "app.lease_seconds must exceed 4 x app.adapter_timeout_secs",
        ));
    }

    if cfg.gmail.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("gmail.access_token must be non-empty"));
    }
    if cfg.gmail.user_id.trim().is_empty() {
        return Err(ConfigError::Invalid("gmail.user_id must be non-empty"));
    }
    if cfg.gmail.query.trim().is_empty() {
        return Err(ConfigError::Invalid("gmail.query must be non-empty"));
    }
    if cfg.gmail.intent_label_ids.values().any(|id| id.trim().is_empty()) {
        return Err(ConfigError::Invalid("gmail.intent_label_ids values must be non-empty"));
    }

    let has_url = cfg
        .crm
        .base_url
        .as_deref()
        .is_some_and(|u| !u.trim().is_empty());
    let has_roster = cfg
        .crm
        .roster_path
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());
    if has_url == has_roster {
        return Err(ConfigError::Invalid(
            "exactly one of crm.base_url or crm.roster_path must be set",
        ));
    }

    if cfg.classifier.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("classifier.api_key must be non-empty"));
    }
    if cfg.classifier.model.trim().is_empty() {
        return Err(ConfigError::Invalid("classifier.model must be non-empty"));
    }
    if let Some(min) = cfg.classifier.min_confidence {
        if !(0.0..=1.0).contains(&min) {
            return Err(ConfigError::Invalid(
                "classifier.min_confidence must be within 0.0..=1.0",
            ));
        }
    }

    Ok(())
}

/// Example configuration, also used by the tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000
  batch_size: 20
  max_attempts: 3
  workers: 4
  adapter_timeout_secs: 30
  lease_seconds: 300

gmail:
  access_token: "YOUR_GMAIL_OAUTH_ACCESS_TOKEN"
  user_id: "me"
  query: "is:unread in:inbox"
  processed_label_id: "Label_candidate_processed"
  intent_label_ids:
    Inquiry: "Label_inquiry"
    Scheduling: "Label_scheduling"
    Offer: "Label_offer"
    Rejection: "Label_rejection"

crm:
  base_url: "https://crm.example.com/api/"
  api_token: "YOUR_CRM_TOKEN"

classifier:
  api_key: "YOUR_OPENAI_API_KEY"
  model: "gpt-4o-mini"
  temperature: 0.3
  min_confidence: 0.6
"#
}
