//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/docsync/config.toml)
//! 3. Environment variables (DOCSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix
const ENV_PREFIX: &str = "DOCSYNC";

/// Reconnect waits after consecutive connection errors
pub const DEFAULT_ERROR_WAIT_MS: [u64; 4] = [200, 1000, 5000, 30_000];

/// Errors that can occur while loading or saving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to parse config TOML: {0}")]
    ParseStr(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket URL of the analysis service
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Suffix of generated resource names
    #[serde(default = "default_resource_extension")]
    pub resource_extension: String,

    /// Log level for docsync crates
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

/// Timings of the connection resilience machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Wait before the Nth retry; the last entry repeats
    pub error_wait_ms: Vec<u64>,
    /// Give up on an opening socket after this long
    pub open_timeout_ms: u64,
    /// Idle time between keepalive probes
    pub ping_period_ms: u64,
    /// Close the connection after the tab was hidden this long
    pub idle_timeout_ms: u64,
    /// How many recent error messages to keep
    pub max_recent_errors: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            error_wait_ms: DEFAULT_ERROR_WAIT_MS.to_vec(),
            open_timeout_ms: 10_000,
            ping_period_ms: 10_000,
            idle_timeout_ms: 300_000,
            max_recent_errors: 16,
        }
    }
}

impl ConnectionConfig {
    /// Backoff before retrying after `error_count` consecutive errors
    pub fn error_wait_time(&self, error_count: usize) -> Duration {
        let schedule: &[u64] = if self.error_wait_ms.is_empty() {
            &DEFAULT_ERROR_WAIT_MS
        } else {
            &self.error_wait_ms
        };
        let index = error_count.saturating_sub(1).min(schedule.len() - 1);
        Duration::from_millis(schedule[index])
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Timings of the sync service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after an edit before an automatic update
    pub update_debounce_ms: u64,
    /// Bounded wait for a single request
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_debounce_ms: 500,
            request_timeout_ms: 15_000,
        }
    }
}

impl SyncConfig {
    pub fn update_debounce(&self) -> Duration {
        Duration::from_millis(self.update_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            resource_extension: default_resource_extension(),
            log_level: default_log_level(),
            log_file: None,
            connection: ConnectionConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DOCSYNC_ENDPOINT, DOCSYNC_LOG_LEVEL, ...)
    /// 2. Config file (~/.config/docsync/config.toml or DOCSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(toml_content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // DOCSYNC_ENDPOINT
        if let Ok(val) = std::env::var(format!("{}_ENDPOINT", ENV_PREFIX)) {
            self.endpoint = if val.is_empty() { None } else { Some(val) };
        }

        // DOCSYNC_LOG_LEVEL
        if let Ok(val) = std::env::var(format!("{}_LOG_LEVEL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.log_level = val;
            }
        }

        // DOCSYNC_LOG_FILE
        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        // DOCSYNC_REQUEST_TIMEOUT_MS
        if let Ok(val) = std::env::var(format!("{}_REQUEST_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.sync.request_timeout_ms = ms;
            }
        }
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with DOCSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docsync")
            .join("config.toml")
    }
}

fn default_resource_extension() -> String {
    "problem".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
