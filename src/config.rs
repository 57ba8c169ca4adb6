//! Configuration loader and validator for the sync service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Top-level configuration, one struct per YAML section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub services: Services,
    pub encryption: Encryption,
    pub sync: Sync,
    pub notifications: Notifications,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
    pub queue_depth: usize,
}

/// Upstream service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Services {
    pub keep_extractor_url: String,
    pub notion_writer_url: String,
    pub request_timeout_secs: u64,
}

/// At-rest encryption settings for stored credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Encryption {
    pub key: String,
}

/// Sync run knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sync {
    pub note_limit: Option<u32>,
}

/// Critical-error notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

impl Config {
    /// Create `app.data_dir` when it does not exist yet.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file, apply environment overrides, and
/// validate the result.
/// - Defaults to `config.yaml` in the working directory when `path` is None.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

/// Environment variables take precedence over the file:
/// `SYNC_ENCRYPTION_KEY` replaces `encryption.key`, `SYNC_NOTE_LIMIT`
/// replaces `sync.note_limit` (unparseable values are ignored with a
/// warning). `DATABASE_URL` is handled by the binaries, not here.
fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(key) = std::env::var("SYNC_ENCRYPTION_KEY") {
        if !key.trim().is_empty() {
            cfg.encryption.key = key;
        }
    }
    if let Ok(raw) = std::env::var("SYNC_NOTE_LIMIT") {
        if !raw.trim().is_empty() {
            match raw.trim().parse::<u32>() {
                Ok(limit) => cfg.sync.note_limit = Some(limit),
                Err(_) => warn!(value = %raw, "invalid SYNC_NOTE_LIMIT, ignoring"),
            }
        }
    }
}

/// Reject configurations that cannot produce a working service.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.bind_addr must be a host:port address"));
    }
    if cfg.app.queue_depth == 0 {
        return Err(ConfigError::Invalid("app.queue_depth must be > 0"));
    }

    if cfg.services.keep_extractor_url.trim().is_empty() {
        return Err(ConfigError::Invalid("services.keep_extractor_url must be non-empty"));
    }
    if cfg.services.notion_writer_url.trim().is_empty() {
        return Err(ConfigError::Invalid("services.notion_writer_url must be non-empty"));
    }
    if cfg.services.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("services.request_timeout_secs must be > 0"));
    }

    if cfg.encryption.key.trim().is_empty() {
        return Err(ConfigError::Invalid("encryption.key must be non-empty"));
    }

    if let Some(limit) = cfg.sync.note_limit {
        if limit == 0 {
            return Err(ConfigError::Invalid("sync.note_limit must be > 0 when set"));
        }
    }

    if cfg.notifications.enabled
        && cfg
            .notifications
            .webhook_url
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
    {
        return Err(ConfigError::Invalid(
            "notifications.webhook_url must be set when notifications are enabled",
        ));
    }

    Ok(())
}

/// Returns the canonical example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:8005"
  queue_depth: 16

services:
  keep_extractor_url: "http://localhost:8003"
  notion_writer_url: "http://localhost:8004"
  request_timeout_secs: 1800

encryption:
  key: "REPLACE_WITH_BASE64_32_BYTE_KEY"

sync:
  note_limit: null

notifications:
  enabled: false
  webhook_url: null
"#
}
