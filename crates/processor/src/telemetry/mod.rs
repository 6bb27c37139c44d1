//! Pipeline telemetry and log output
//!
//! Batch counters live in [`batch`]. [`init_tracing`] installs the global
//! `tracing` subscriber; the library itself only emits events and leaves
//! subscriber setup to the binary.
//!
//! # Example
//!
//! ```rust,no_run
//! use iomt_processor::config::LoggingConfig;
//! use iomt_processor::telemetry::init_tracing;
//!
//! init_tracing(&LoggingConfig::default()).expect("subscriber already installed");
//! tracing::info!(partition = 0, "pipeline starting");
//! ```

pub mod batch;

pub use batch::{BatchTelemetry, EmissionCounters, EventTypeCounters, GroupingCounters, TelemetryAccumulator};

use crate::config::LoggingConfig;
use crate::error::ConfigError;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` or the configured level
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| ConfigError::Invalid(format!("log level '{}': {}", config.level, e)))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ConfigError::Invalid(format!("tracing subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "info,iomt_processor=loudest".to_string(),
            json: false,
        };
        assert!(init_tracing(&config).is_err());
    }
}
