//! Configuration for the mousetrace capture engine.

use crate::collector::CollectorConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on rows returned by a single sandboxed query.
pub const MAX_QUERY_ROWS: usize = 10_000;

/// Main configuration for the capture engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file
    pub db_path: PathBuf,

    /// Foreground-application polls per second
    pub poll_hz: f64,

    /// Maximum persisted pointer-move samples per second
    pub move_hz: f64,

    /// Inactivity threshold for closing a session; `None` disables idle closing
    #[serde(with = "optional_secs_serde")]
    pub idle_timeout: Option<Duration>,

    /// Persist pointer moves
    pub record_moves: bool,

    /// Persist keyboard events
    pub record_keys: bool,

    /// Flush cadence of the batch writer
    #[serde(with = "millis_serde")]
    pub flush_interval: Duration,

    /// Buffered records that trigger an early flush
    pub flush_batch_size: usize,

    /// Retries for a busy/locked store before giving up
    pub flush_max_retries: u32,

    /// First retry delay; doubles on every attempt
    #[serde(with = "millis_serde")]
    pub flush_backoff_base: Duration,

    /// Default row cap for sandboxed queries
    pub query_row_limit: usize,

    /// Wall-clock budget for a sandboxed query
    #[serde(with = "millis_serde")]
    pub query_timeout: Duration,

    /// Timestamp regressions up to this size are clamped without being flagged
    #[serde(with = "millis_serde")]
    pub clock_skew_tolerance: Duration,

    /// Log filter used when RUST_LOG is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mousetrace");

        Self {
            db_path: data_dir.join("mousetrace.db"),
            poll_hz: 10.0,
            move_hz: 30.0,
            idle_timeout: None,
            record_moves: true,
            record_keys: true,
            flush_interval: Duration::from_secs(1),
            flush_batch_size: 500,
            flush_max_retries: 5,
            flush_backoff_base: Duration::from_millis(50),
            query_row_limit: 200,
            query_timeout: Duration::from_secs(5),
            clock_skew_tolerance: Duration::from_millis(1000),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file, falling back to defaults if absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mousetrace")
            .join("config.json")
    }

    /// Check that rates, sizes and durations are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.poll_hz.is_finite() && self.poll_hz > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "poll_hz must be a positive rate, got {}",
                self.poll_hz
            )));
        }
        if !(self.move_hz.is_finite() && self.move_hz > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "move_hz must be a positive rate, got {}",
                self.move_hz
            )));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid(
                "idle_timeout must be positive when set".into(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid("flush_interval must be positive".into()));
        }
        if self.flush_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "flush_batch_size must be at least 1".into(),
            ));
        }
        if self.query_row_limit == 0 || self.query_row_limit > MAX_QUERY_ROWS {
            return Err(ConfigError::Invalid(format!(
                "query_row_limit must be between 1 and {MAX_QUERY_ROWS}"
            )));
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigError::Invalid("query_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.poll_hz)
    }

    pub fn move_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.move_hz)
    }

    /// The idle threshold as a whole number of poll ticks, rounded up.
    pub fn idle_ticks(&self) -> Option<u32> {
        self.idle_timeout.map(|idle| {
            let ticks = (idle.as_secs_f64() * self.poll_hz).ceil();
            (ticks as u32).max(1)
        })
    }

    /// Capture counters of the last run, kept next to the database.
    pub fn stats_path(&self) -> PathBuf {
        self.db_path.with_extension("stats.json")
    }

    /// Adapter settings implied by the recording switches.
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            capture_keyboard: self.record_keys,
            capture_mouse: true,
            capture_moves: self.record_moves,
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as integer milliseconds.
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for an optional Duration as integer seconds.
mod optional_secs_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
