//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};
use crate::error::{Error, Result};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `config.level` when set. Fails if a subscriber is
/// already installed or the filter does not parse.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.format {
        LogFormat::Console => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    result.map_err(|e| Error::Configuration(format!("tracing init failed: {}", e)))
}

fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Configuration(format!("invalid log level '{}': {}", config.level, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_config() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LogConfig {
            level: "health_ingest=debug,warn".to_string(),
            format: LogFormat::Console,
        };
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
