//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [storage]
//! path = "/var/lib/tally/sessions.db"
//!
//! [flush]
//! interval_secs = 600
//! flush_open_sessions = true
//! max_inflight = 2
//!
//! [logging]
//! dir = "/var/log/tally"
//! console_filter = "info"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_session::{DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_INFLIGHT_FLUSHES, TrackerConfig};

use crate::{ConfigError, Result};

/// Application name used for platform directories.
pub(crate) const APP_NAME: &str = "tally";

/// Database filename inside the data directory.
const DEFAULT_DB_FILE: &str = "sessions.db";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// Every section is optional so partial files can be layered; the accessors
/// fill in defaults for whatever no layer set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub storage: Option<StorageConfig>,
    pub flush: Option<FlushConfig>,
    pub logging: Option<LoggingConfig>,
}

impl TallyConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced whole, not field by field.
    pub fn merge(&mut self, other: TallyConfig) {
        if other.storage.is_some() {
            self.storage = other.storage;
        }
        if other.flush.is_some() {
            self.flush = other.flush;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    pub fn storage(&self) -> StorageConfig {
        self.storage.clone().unwrap_or_default()
    }

    pub fn flush(&self) -> FlushConfig {
        self.flush.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        if let Some(flush) = &self.flush {
            if flush.interval_secs == 0 {
                return Err(ConfigError::Invalid {
                    field: "flush.interval_secs".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            if flush.max_inflight == 0 {
                return Err(ConfigError::Invalid {
                    field: "flush.max_inflight".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────────────────────────────────────

/// Where the session database lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Defaults to the platform data directory.
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// The configured path, or `<data dir>/tally/sessions.db`, or
    /// `./sessions.db` when the platform has no data directory.
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        dirs::data_dir()
            .map(|d| d.join(APP_NAME).join(DEFAULT_DB_FILE))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Flush
// ─────────────────────────────────────────────────────────────────────────────

/// Write-back flush settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Seconds between periodic flushes.
    pub interval_secs: u64,
    /// Whether the periodic flush also persists open sessions.
    pub flush_open_sessions: bool,
    /// Maximum background commits running at once.
    pub max_inflight: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_FLUSH_INTERVAL.as_secs(),
            flush_open_sessions: true,
            max_inflight: DEFAULT_MAX_INFLIGHT_FLUSHES,
        }
    }
}

impl FlushConfig {
    pub fn to_tracker_config(&self) -> TrackerConfig {
        TrackerConfig::new()
            .with_flush_interval(Duration::from_secs(self.interval_secs))
            .with_flush_open_sessions(self.flush_open_sessions)
            .with_max_inflight_flushes(self.max_inflight)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the daily JSON log files. `None` disables file logging.
    pub dir: Option<PathBuf>,
    /// `EnvFilter` directive for the console, used when `RUST_LOG` is unset.
    pub console_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            console_filter: "info".to_string(),
        }
    }
}
