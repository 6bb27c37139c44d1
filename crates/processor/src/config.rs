//! Configuration types for the conversion pipeline
//!
//! Every section has serde defaults and its own `validate()`; the top-level
//! [`ProcessorConfig::load`] layers a YAML file and `IOMT_`-prefixed
//! environment variables (`__` separates sections) over the defaults.

use crate::error::ConfigError;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

type Result<T> = std::result::Result<T, ConfigError>;

/// Main processor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Window and late-data configuration
    #[serde(default)]
    pub window: WindowConfig,

    /// Normalization stage configuration
    #[serde(default)]
    pub normalization: NormalizationConfig,

    /// Conversion stage configuration
    #[serde(default)]
    pub conversion: ConversionConfig,

    /// Emission queue and retry configuration
    #[serde(default)]
    pub emission: EmissionConfig,

    /// Dead-letter destination
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProcessorConfig {
    /// Load configuration from an optional YAML file and the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ProcessorConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("IOMT_").split("__"));

        let config: ProcessorConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.conversion.validate()?;
        self.emission.validate()?;
        self.dead_letter.validate()?;
        Ok(())
    }
}

/// What happens to a measurement whose window has already sealed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    /// Drop the measurement and count it
    #[default]
    Drop,
    /// Reopen the sealed window and re-emit it with the late measurement
    Reopen,
}

/// Window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Tumbling window size in milliseconds
    #[serde(default = "default_window_size")]
    pub size_ms: u64,

    /// How far behind the newest event time the watermark trails (milliseconds)
    #[serde(default = "default_allowed_lateness")]
    pub allowed_lateness_ms: u64,

    /// Policy for measurements whose window has sealed
    #[serde(default)]
    pub late_policy: LatePolicy,

    /// How long past its end a sealed window is remembered (milliseconds)
    ///
    /// Within it, late measurements for the window are dropped or reopen it,
    /// whatever partition they arrive on.
    #[serde(default = "default_late_retention")]
    pub late_retention_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_ms: default_window_size(),
            allowed_lateness_ms: default_allowed_lateness(),
            late_policy: LatePolicy::default(),
            late_retention_ms: default_late_retention(),
        }
    }
}

impl WindowConfig {
    /// Create a tumbling window configuration
    pub fn tumbling(size_ms: u64, allowed_lateness_ms: u64) -> Self {
        Self {
            size_ms,
            allowed_lateness_ms,
            ..Default::default()
        }
    }

    /// Set the late-arrival policy
    pub fn with_late_policy(mut self, policy: LatePolicy) -> Self {
        self.late_policy = policy;
        self
    }

    /// Set the reopen retention
    pub fn with_late_retention(mut self, retention_ms: u64) -> Self {
        self.late_retention_ms = retention_ms;
        self
    }

    /// Validate window configuration
    pub fn validate(&self) -> Result<()> {
        if self.size_ms == 0 {
            return Err(ConfigError::Invalid("window size_ms must be greater than 0".into()));
        }
        if self.size_ms > i64::MAX as u64 || self.allowed_lateness_ms > i64::MAX as u64 {
            return Err(ConfigError::Invalid("window durations out of range".into()));
        }
        Ok(())
    }

    pub fn size(&self) -> Duration {
        Duration::from_millis(self.size_ms)
    }

    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_millis(self.allowed_lateness_ms)
    }
}

/// What happens to events no template matched
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedPolicy {
    /// Only count the event
    #[default]
    CountOnly,
    /// Count the event and write it to the dead-letter path
    DeadLetter,
}

/// Normalization stage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizationConfig {
    #[serde(default)]
    pub unmapped_policy: UnmappedPolicy,
}

/// Conversion stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Identifier system stamped on every synthesized resource
    #[serde(default = "default_identifier_system")]
    pub identifier_system: String,

    /// Sampling period used when a SampledData mapping declares none (milliseconds)
    #[serde(default = "default_sampled_data_period")]
    pub sampled_data_period_ms: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            identifier_system: default_identifier_system(),
            sampled_data_period_ms: default_sampled_data_period(),
        }
    }
}

impl ConversionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.identifier_system.trim().is_empty() {
            return Err(ConfigError::Invalid("conversion identifier_system must not be empty".into()));
        }
        if self.sampled_data_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "conversion sampled_data_period_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Emission queue and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissionConfig {
    /// Sealed groups buffered before intake pauses
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Retries after the first failed upsert
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    /// Upper bound on a single backoff delay (milliseconds)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for EmissionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl EmissionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("emission queue_capacity must be greater than 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "emission max_backoff_ms must be at least base_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = self
            .base_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(16)));
        Duration::from_millis(backoff_ms.min(self.max_backoff_ms))
    }
}

/// Dead-letter destination kind
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    #[default]
    Memory,
    File,
}

/// Dead-letter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    #[serde(default)]
    pub kind: DeadLetterKind,

    /// Directory for the file dead-letter queue
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DeadLetterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kind == DeadLetterKind::File && self.path.is_none() {
            return Err(ConfigError::Invalid("file dead-letter queue requires a path".into()));
        }
        Ok(())
    }
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_window_size() -> u64 {
    60_000
}

fn default_allowed_lateness() -> u64 {
    5_000
}

fn default_late_retention() -> u64 {
    300_000
}

fn default_identifier_system() -> String {
    "urn:iomt:observation".to_string()
}

fn default_sampled_data_period() -> u64 {
    1_000
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}
