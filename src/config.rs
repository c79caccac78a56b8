//! Configuration
//!
//! Components take plain config structs with `Default` values. [`Settings`]
//! is the file form: a flat TOML document where every key is optional,
//! overridable from `HEALTH_INGEST_*` environment variables, and converted
//! into a [`PipelineConfig`] once validated.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::breaker::BreakerConfig;
use crate::dlq::DeadLetterConfig;
use crate::error::{Error, Result};
use crate::gate::GateConfig;
use crate::router::RouterConfig;
use crate::services::HealthConfig;
use crate::writer::{BucketTarget, InfluxConfig, WriterConfig};

/// Environment variable naming the settings file
pub const CONFIG_PATH_ENV: &str = "HEALTH_INGEST_CONFIG";

/// Settings file read when [`CONFIG_PATH_ENV`] is unset
pub const DEFAULT_CONFIG_FILE: &str = "health-ingest.toml";

const ENV_PREFIX: &str = "HEALTH_INGEST_";

// =============================================================================
// Component Configuration
// =============================================================================

/// Configuration of every pipeline component
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Router
    pub router: RouterConfig,
    /// Duplicate gate
    pub gate: GateConfig,
    /// Circuit breaker guarding the backend
    pub breaker: BreakerConfig,
    /// Batching writer
    pub writer: WriterConfig,
    /// Dead-letter store
    pub dlq: DeadLetterConfig,
    /// Health watchdog
    pub health: HealthConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Console,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "pretty" | "text" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Configuration(format!("unknown log format '{}'", other))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// =============================================================================
// Settings File
// =============================================================================

/// Settings loaded from TOML and the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Source tag for items that carry none
    #[serde(default = "default_source")]
    pub default_source: String,

    /// InfluxDB base URL
    #[serde(default = "default_influx_url")]
    pub influx_url: String,

    /// InfluxDB API token; empty means unauthenticated
    #[serde(default)]
    pub influx_token: String,

    /// Storage organization
    #[serde(default = "default_influx_org")]
    pub influx_org: String,

    /// Storage bucket
    #[serde(default = "default_influx_bucket")]
    pub influx_bucket: String,

    /// Records per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batch linger time in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Writer submission buffer capacity
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Write retries after the first attempt
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Per-attempt write timeout in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Consecutive failures that open the breaker
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// Breaker cooldown in seconds
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    /// Duplicate window in hours
    #[serde(default = "default_dedup_ttl_hours")]
    pub dedup_ttl_hours: u64,

    /// Maximum live fingerprints
    #[serde(default = "default_dedup_max_size")]
    pub dedup_max_size: usize,

    /// Gate checkpoint file
    #[serde(default)]
    pub dedup_checkpoint_path: Option<PathBuf>,

    /// Gate checkpoint interval in seconds
    #[serde(default = "default_dedup_checkpoint_interval_secs")]
    pub dedup_checkpoint_interval_secs: u64,

    /// Dead-letter capacity
    #[serde(default = "default_dlq_max_entries")]
    pub dlq_max_entries: usize,

    /// Dead-letter retention in days
    #[serde(default = "default_dlq_retention_days")]
    pub dlq_retention_days: u64,

    /// Failed replays before an entry is abandoned
    #[serde(default = "default_dlq_max_retries")]
    pub dlq_max_retries: u32,

    /// Dead-letter snapshot file
    #[serde(default)]
    pub dlq_snapshot_path: Option<PathBuf>,

    /// Dead-letter maintenance interval in seconds
    #[serde(default = "default_dlq_maintenance_interval_secs")]
    pub dlq_maintenance_interval_secs: u64,

    /// Health check interval in seconds
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

fn default_source() -> String {
    "health_auto_export".to_string()
}

fn default_influx_url() -> String {
    "http://localhost:8086".to_string()
}

fn default_influx_org() -> String {
    "health".to_string()
}

fn default_influx_bucket() -> String {
    "apple_health".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    30_000
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_max_write_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    30
}

fn default_dedup_ttl_hours() -> u64 {
    24
}

fn default_dedup_max_size() -> usize {
    100_000
}

fn default_dedup_checkpoint_interval_secs() -> u64 {
    300
}

fn default_dlq_max_entries() -> usize {
    10_000
}

fn default_dlq_retention_days() -> u64 {
    30
}

fn default_dlq_max_retries() -> u32 {
    3
}

fn default_dlq_maintenance_interval_secs() -> u64 {
    60
}

fn default_health_check_interval_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_source: default_source(),
            influx_url: default_influx_url(),
            influx_token: String::new(),
            influx_org: default_influx_org(),
            influx_bucket: default_influx_bucket(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            buffer_capacity: default_buffer_capacity(),
            max_write_retries: default_max_write_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            dedup_ttl_hours: default_dedup_ttl_hours(),
            dedup_max_size: default_dedup_max_size(),
            dedup_checkpoint_path: None,
            dedup_checkpoint_interval_secs: default_dedup_checkpoint_interval_secs(),
            dlq_max_entries: default_dlq_max_entries(),
            dlq_retention_days: default_dlq_retention_days(),
            dlq_max_retries: default_dlq_max_retries(),
            dlq_snapshot_path: None,
            dlq_maintenance_interval_secs: default_dlq_maintenance_interval_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            log: LogConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from the configured file, then apply environment
    /// overrides and validate
    ///
    /// The file named by `HEALTH_INGEST_CONFIG` must exist; the default
    /// `./health-ingest.toml` is optional.
    pub fn load() -> Result<Self> {
        let mut settings = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            Err(_) => {
                info!("Using default configuration");
                Self::default()
            }
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a settings file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let settings = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded configuration from file");
        Ok(settings)
    }

    /// Parse settings from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Apply `HEALTH_INGEST_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        override_string(&get, "DEFAULT_SOURCE", &mut self.default_source);
        override_string(&get, "INFLUX_URL", &mut self.influx_url);
        override_string(&get, "INFLUX_TOKEN", &mut self.influx_token);
        override_string(&get, "INFLUX_ORG", &mut self.influx_org);
        override_string(&get, "INFLUX_BUCKET", &mut self.influx_bucket);
        override_parsed(&get, "BATCH_SIZE", &mut self.batch_size)?;
        override_parsed(&get, "FLUSH_INTERVAL_MS", &mut self.flush_interval_ms)?;
        override_parsed(&get, "BUFFER_CAPACITY", &mut self.buffer_capacity)?;
        override_parsed(&get, "MAX_WRITE_RETRIES", &mut self.max_write_retries)?;
        override_parsed(&get, "BACKOFF_BASE_MS", &mut self.backoff_base_ms)?;
        override_parsed(&get, "BACKOFF_MAX_MS", &mut self.backoff_max_ms)?;
        override_parsed(&get, "WRITE_TIMEOUT_MS", &mut self.write_timeout_ms)?;
        override_parsed(&get, "BREAKER_THRESHOLD", &mut self.breaker_threshold)?;
        override_parsed(&get, "BREAKER_COOLDOWN_SECS", &mut self.breaker_cooldown_secs)?;
        override_parsed(&get, "DEDUP_TTL_HOURS", &mut self.dedup_ttl_hours)?;
        override_parsed(&get, "DEDUP_MAX_SIZE", &mut self.dedup_max_size)?;
        override_path(&get, "DEDUP_CHECKPOINT_PATH", &mut self.dedup_checkpoint_path);
        override_parsed(
            &get,
            "DEDUP_CHECKPOINT_INTERVAL_SECS",
            &mut self.dedup_checkpoint_interval_secs,
        )?;
        override_parsed(&get, "DLQ_MAX_ENTRIES", &mut self.dlq_max_entries)?;
        override_parsed(&get, "DLQ_RETENTION_DAYS", &mut self.dlq_retention_days)?;
        override_parsed(&get, "DLQ_MAX_RETRIES", &mut self.dlq_max_retries)?;
        override_path(&get, "DLQ_SNAPSHOT_PATH", &mut self.dlq_snapshot_path);
        override_parsed(
            &get,
            "DLQ_MAINTENANCE_INTERVAL_SECS",
            &mut self.dlq_maintenance_interval_secs,
        )?;
        override_parsed(
            &get,
            "HEALTH_CHECK_INTERVAL_SECS",
            &mut self.health_check_interval_secs,
        )?;
        override_string(&get, "LOG_LEVEL", &mut self.log.level);
        override_parsed(&get, "LOG_FORMAT", &mut self.log.format)?;
        Ok(())
    }

    /// Reject values that would stall or disable a component
    pub fn validate(&self) -> Result<()> {
        let positive: [(&str, u64); 12] = [
            ("batch_size", self.batch_size as u64),
            ("flush_interval_ms", self.flush_interval_ms),
            ("buffer_capacity", self.buffer_capacity as u64),
            ("write_timeout_ms", self.write_timeout_ms),
            ("breaker_threshold", self.breaker_threshold as u64),
            ("dedup_ttl_hours", self.dedup_ttl_hours),
            ("dedup_max_size", self.dedup_max_size as u64),
            ("dedup_checkpoint_interval_secs", self.dedup_checkpoint_interval_secs),
            ("dlq_max_entries", self.dlq_max_entries as u64),
            ("dlq_retention_days", self.dlq_retention_days),
            ("dlq_maintenance_interval_secs", self.dlq_maintenance_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Configuration(format!("{} must be greater than 0", name)));
            }
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Configuration(
                "backoff_base_ms must not exceed backoff_max_ms".to_string(),
            ));
        }
        if self.influx_url.trim().is_empty()
            || self.influx_org.trim().is_empty()
            || self.influx_bucket.trim().is_empty()
        {
            return Err(Error::Configuration(
                "influx_url, influx_org and influx_bucket must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// InfluxDB connection settings
    pub fn influx_config(&self) -> InfluxConfig {
        let token = self.influx_token.trim();
        InfluxConfig {
            url: self.influx_url.trim().to_string(),
            token: (!token.is_empty()).then(|| token.to_string()),
            request_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    /// Build the component configuration
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            router: RouterConfig {
                default_source: self.default_source.clone(),
            },
            gate: GateConfig {
                ttl: Duration::from_secs(self.dedup_ttl_hours.saturating_mul(3600)),
                max_entries: self.dedup_max_size,
                checkpoint_path: self.dedup_checkpoint_path.clone(),
                checkpoint_interval: Duration::from_secs(self.dedup_checkpoint_interval_secs),
            },
            breaker: BreakerConfig {
                failure_threshold: self.breaker_threshold,
                cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            },
            writer: WriterConfig {
                max_batch_size: self.batch_size,
                linger: Duration::from_millis(self.flush_interval_ms),
                buffer_capacity: self.buffer_capacity,
                max_retries: self.max_write_retries,
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_max: Duration::from_millis(self.backoff_max_ms),
                write_timeout: Duration::from_millis(self.write_timeout_ms),
                target: BucketTarget {
                    org: self.influx_org.clone(),
                    bucket: self.influx_bucket.clone(),
                },
            },
            dlq: DeadLetterConfig {
                max_entries: self.dlq_max_entries,
                retention: Duration::from_secs(self.dlq_retention_days.saturating_mul(24 * 3600)),
                max_retries: self.dlq_max_retries,
                snapshot_path: self.dlq_snapshot_path.clone(),
                maintenance_interval: Duration::from_secs(self.dlq_maintenance_interval_secs),
            },
            health: HealthConfig {
                check_interval: Duration::from_secs(self.health_check_interval_secs),
                ..HealthConfig::default()
            },
        }
    }
}

fn override_string(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut String) {
    if let Some(value) = get(key) {
        *slot = value;
    }
}

fn override_path(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Option<PathBuf>) {
    if let Some(value) = get(key) {
        *slot = if value.is_empty() {
            None
        } else {
            Some(PathBuf::from(value))
        };
    }
}

fn override_parsed<T>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = get(key) {
        *slot = value.trim().parse().map_err(|e| {
            Error::Configuration(format!("{}{}='{}': {}", ENV_PREFIX, key, value, e))
        })?;
    }
    Ok(())
}
