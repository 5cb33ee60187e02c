//! Connector configuration.
//!
//! Settings live in `{data_dir}/config.toml`. Environment variables take
//! precedence over the file:
//!
//! | Variable      | Overrides         |
//! |---------------|-------------------|
//! | `IDLINK_HOME` | the data dir      |
//! | `IDLINK_DB`   | `database`        |
//! | `IDLINK_LOG`  | `log_filter`      |

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LOG_FILTER: &str = "info";
const DB_FILE_NAME: &str = "idlink.db";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot write config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level configuration stored in `{data_dir}/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Database file. Relative paths resolve against the data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    /// Milliseconds a writer waits on a competing transaction.
    pub busy_timeout_ms: u64,
    /// `tracing` filter directive, e.g. `"idlink=debug"`.
    pub log_filter: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            database: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl ConnectorConfig {
    /// Resolve the database file: the configured path, else `{data_dir}/idlink.db`.
    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        match &self.database {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => data_dir.join(path),
            None => data_dir.join(DB_FILE_NAME),
        }
    }

    /// Apply `IDLINK_DB` and `IDLINK_LOG` on top of file values.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(db) = std::env::var("IDLINK_DB") {
            self.database = Some(PathBuf::from(db));
        }
        if let Ok(filter) = std::env::var("IDLINK_LOG") {
            self.log_filter = filter;
        }
        self
    }
}

/// Resolve the idlink home directory from environment or default.
pub fn resolve_data_dir() -> PathBuf {
    std::env::var("IDLINK_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".idlink"))
                .unwrap_or_else(|_| PathBuf::from(".idlink"))
        })
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Load the config file, returning defaults if it doesn't exist.
pub fn load_config(data_dir: &Path) -> Result<ConnectorConfig, ConfigError> {
    let path = config_path(data_dir);
    if !path.exists() {
        return Ok(ConnectorConfig::default());
    }
    let contents = fs::read_to_string(&path)?;
    Ok(toml::from_str(&contents)?)
}

pub fn save_config(data_dir: &Path, config: &ConnectorConfig) -> Result<(), ConfigError> {
    fs::create_dir_all(data_dir)?;
    let contents = toml::to_string_pretty(config)?;
    fs::write(config_path(data_dir), contents)?;
    Ok(())
}
