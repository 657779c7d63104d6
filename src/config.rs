//! Configuration loader and validator for the triage worker.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub mail: Mail,
    pub ai: Ai,
    pub push: Push,
    #[serde(default)]
    pub filter: Filter,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    /// Urgency scores at or above this value count as high priority.
    #[serde(default = "default_threshold")]
    pub high_priority_threshold: u8,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_summarize_concurrency")]
    pub summarize_concurrency: usize,
    #[serde(default = "default_max_run_attempts")]
    pub max_run_attempts: u32,
}

/// Mail provider API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub base_url: String,
    pub token: String,
}

/// AI provider settings for the summarizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ai {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Push gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Push {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Subscription filter tuning. Everything here is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(default)]
    pub extra_bulk_domains: Vec<String>,
}

fn default_threshold() -> u8 {
    70
}

fn default_fetch_concurrency() -> usize {
    4
}

fn default_summarize_concurrency() -> usize {
    2
}

fn default_max_run_attempts() -> u32 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl App {
    /// Data directory with a leading `~/` expanded. Relative paths stay
    /// relative to the working directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(tail) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return Path::new(&home).join(tail);
            }
        }
        PathBuf::from(&self.data_dir)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.high_priority_threshold > 100 {
        return Err(ConfigError::Invalid(
            "app.high_priority_threshold must be <= 100",
        ));
    }
    if cfg.app.fetch_concurrency == 0 {
        return Err(ConfigError::Invalid("app.fetch_concurrency must be > 0"));
    }
    if cfg.app.summarize_concurrency == 0 {
        return Err(ConfigError::Invalid(
            "app.summarize_concurrency must be > 0",
        ));
    }
    if cfg.app.max_run_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_run_attempts must be > 0"));
    }

    if cfg.mail.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.base_url must be non-empty"));
    }
    if cfg.mail.token.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.token must be non-empty"));
    }

    if cfg.ai.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("ai.base_url must be non-empty"));
    }
    if cfg.ai.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("ai.api_key must be non-empty"));
    }
    if cfg.ai.model.trim().is_empty() {
        return Err(ConfigError::Invalid("ai.model must be non-empty"));
    }
    if cfg.ai.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "ai.request_timeout_seconds must be > 0",
        ));
    }

    if cfg.push.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("push.base_url must be non-empty"));
    }
    if cfg.push.token.trim().is_empty() {
        return Err(ConfigError::Invalid("push.token must be non-empty"));
    }

    Ok(())
}

/// Example YAML with every key spelled out at its default.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 60
  high_priority_threshold: 70
  fetch_concurrency: 4
  summarize_concurrency: 2
  max_run_attempts: 5

mail:
  base_url: "https://mail.example.com"
  token: "YOUR_MAIL_API_TOKEN"

ai:
  base_url: "https://ai.example.com"
  api_key: "YOUR_AI_API_KEY"
  model: "triage-small"
  request_timeout_seconds: 30
  max_retries: 3

push:
  base_url: "https://push.example.com"
  token: "YOUR_PUSH_GATEWAY_TOKEN"
  max_retries: 3

filter:
  extra_bulk_domains: []
"#
}
