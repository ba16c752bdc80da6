//! Logging Setup and Span Helpers
//!
//! The pipeline reports everything through `tracing`. Applications that do
//! not install their own subscriber can call [`init_tracing`].

use serde::Deserialize;
use tracing::{span, Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log output configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. Fails if a global
/// subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    tracing::info!(filter = %config.filter, json = config.json, "tracing initialized");
    Ok(())
}

/// Span covering one batch flush
#[inline]
pub fn flush_span(batch_len: usize) -> Span {
    span!(Level::DEBUG, "metrics.flush", batch.len = batch_len)
}

/// Span covering one timed call
#[inline]
pub fn timed_span(fqn: &str) -> Span {
    span!(Level::TRACE, "metrics.timed", fqn = %fqn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config: LogConfig = toml::from_str("").unwrap();
        assert_eq!(config, LogConfig::default());

        let config: LogConfig = toml::from_str("json = true").unwrap();
        assert!(config.json);
        assert_eq!(config.filter, "info");
    }

    #[test]
    fn test_spans_without_subscriber() {
        let _flush = flush_span(3).entered();
        let _timed = timed_span("a.b").entered();
    }
}
