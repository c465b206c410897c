//! Configuration loader and validator for the CRM sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::normalize::SentinelPredicate;
use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub crm: Crm,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// When false, checkpoints only live for the current run and every run
    /// starts from scratch.
    #[serde(default = "default_true")]
    pub persist_checkpoints: bool,
}

/// Remote CRM endpoints. OAuth client id/secret come from the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Crm {
    pub base_url: String,
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    pub page_size: u32,
    pub cursor_ceiling: u64,
    pub search_attempts: u32,
    pub refresh_attempts: u32,
    pub base_delay_ms: u64,
    pub flush_threshold: usize,
    pub queue_capacity: usize,
    pub sentinel_predicate: SentinelPredicate,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            cursor_ceiling: 9_900,
            search_attempts: 5,
            refresh_attempts: 3,
            base_delay_ms: 5_000,
            flush_threshold: 2_000,
            queue_capacity: 10_000,
            sentinel_predicate: SentinelPredicate::Conjunction,
        }
    }
}

impl SyncSettings {
    pub fn search_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.search_attempts,
            Backoff::Exponential {
                base: Duration::from_millis(self.base_delay_ms),
            },
        )
    }

    pub fn refresh_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.refresh_attempts, Backoff::Immediate)
    }
}

fn default_true() -> bool {
    true
}

fn default_token_path() -> String {
    "oauth/v1/token".into()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/crm-sync.db", self.app.data_dir))
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

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.crm.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("crm.base_url must be non-empty"));
    }
    if cfg.crm.token_path.trim().is_empty() {
        return Err(ConfigError::Invalid("crm.token_path must be non-empty"));
    }

    let s = &cfg.sync;
    if s.page_size == 0 || s.page_size > 100 {
        return Err(ConfigError::Invalid("sync.page_size must be within 1..=100"));
    }
    if s.cursor_ceiling < u64::from(s.page_size) {
        return Err(ConfigError::Invalid("sync.cursor_ceiling must be >= sync.page_size"));
    }
    if s.search_attempts == 0 {
        return Err(ConfigError::Invalid("sync.search_attempts must be > 0"));
    }
    if s.refresh_attempts == 0 {
        return Err(ConfigError::Invalid("sync.refresh_attempts must be > 0"));
    }
    if s.queue_capacity == 0 {
        return Err(ConfigError::Invalid("sync.queue_capacity must be > 0"));
    }
    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  persist_checkpoints: true

crm:
  base_url: "https://api.hubapi.com/"
  token_path: "oauth/v1/token"

sync:
  page_size: 100
  cursor_ceiling: 9900
  search_attempts: 5
  refresh_attempts: 3
  base_delay_ms: 5000
  flush_threshold: 2000
  queue_capacity: 10000
  sentinel_predicate: conjunction
"#
}
