//! Pipeline Configuration
//!
//! TOML-loadable description of the whole pipeline: which sinks metrics fan
//! out to, whether each is wrapped in a [`ThreadedBackend`], batching knobs,
//! and logging.
//!
//! ```toml
//! duration_field = "value"
//! origin = "billing-api"
//!
//! [threaded]
//! queue_maxsize = 1000
//! queue_timeout = 0.5
//! bulk_size = 50
//! bulk_timeout = 1.0
//!
//! [[sinks]]
//! kind = "jsonl"
//! options = { path = "/var/log/metrics.jsonl" }
//!
//! [[sinks]]
//! kind = "log"
//! threaded = false
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `TIME_EXECUTION_DURATION_FIELD` | `duration_field` |
//! | `TIME_EXECUTION_ORIGIN` | `origin` |
//! | `TIME_EXECUTION_QUEUE_MAXSIZE` | `threaded.queue_maxsize` |
//! | `TIME_EXECUTION_QUEUE_TIMEOUT` | `threaded.queue_timeout` (seconds) |
//! | `TIME_EXECUTION_BULK_SIZE` | `threaded.bulk_size` |
//! | `TIME_EXECUTION_BULK_TIMEOUT` | `threaded.bulk_timeout` (seconds) |
//! | `TIME_EXECUTION_LAZY_INIT` | `threaded.lazy_init` |
//! | `TIME_EXECUTION_LOG_JSON` | `log.json` |

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendError, SinkSource, ThreadedBackend, ThreadedConfig};
use crate::observability::LogConfig;
use crate::settings::{Settings, DEFAULT_DURATION_FIELD};
use crate::sink::{SharedSink, SinkError, SinkOptions, SinkRegistry};

const ENV_PREFIX: &str = "TIME_EXECUTION_";

/// Errors loading or applying configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value `{value}` for {key}")]
    InvalidEnv { key: String, value: String },

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One configured sink
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SinkSpec {
    /// Registry kind, e.g. `"jsonl"`
    pub kind: String,
    /// Wrap the sink in a threaded backend
    #[serde(default = "default_threaded")]
    pub threaded: bool,
    /// Keyword options for the sink factory
    #[serde(default)]
    pub options: toml::Table,
}

fn default_threaded() -> bool {
    true
}

impl SinkSpec {
    pub fn new(kind: &str) -> Self {
        SinkSpec {
            kind: kind.to_string(),
            threaded: true,
            options: toml::Table::new(),
        }
    }

    pub fn direct(mut self) -> Self {
        self.threaded = false;
        self
    }

    pub fn with_option(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

/// Whole-pipeline configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Field name the call duration is stored under
    pub duration_field: String,
    /// Optional tag added to every timed metric
    pub origin: Option<String>,
    pub log: LogConfig,
    /// Settings for every threaded sink
    pub threaded: ThreadedConfig,
    pub sinks: Vec<SinkSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            duration_field: DEFAULT_DURATION_FIELD.to_string(),
            origin: None,
            log: LogConfig::default(),
            threaded: ThreadedConfig::default(),
            sinks: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Parse from TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overridden by `TIME_EXECUTION_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Apply `TIME_EXECUTION_*` environment overrides
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by full variable name
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let key = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = get("DURATION_FIELD") {
            self.duration_field = value;
        }
        if let Some((_, value)) = get("ORIGIN") {
            self.origin = Some(value).filter(|v| !v.is_empty());
        }
        if let Some((key, value)) = get("QUEUE_MAXSIZE") {
            self.threaded.queue_maxsize = parse_env(key, value)?;
        }
        if let Some((key, value)) = get("QUEUE_TIMEOUT") {
            self.threaded.queue_timeout = parse_secs(key, value)?;
        }
        if let Some((key, value)) = get("BULK_SIZE") {
            self.threaded.bulk_size = parse_env(key, value)?;
        }
        if let Some((key, value)) = get("BULK_TIMEOUT") {
            self.threaded.bulk_timeout = parse_secs(key, value)?;
        }
        if let Some((key, value)) = get("LAZY_INIT") {
            self.threaded.lazy_init = parse_env(key, value)?;
        }
        if let Some((key, value)) = get("LOG_JSON") {
            self.log.json = parse_env(key, value)?;
        }
        Ok(self)
    }

    pub fn with_sink(mut self, sink: SinkSpec) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn with_threaded(mut self, threaded: ThreadedConfig) -> Self {
        self.threaded = threaded;
        self
    }

    /// Build every configured sink and assemble [`Settings`]
    pub fn build_settings(&self, registry: &SinkRegistry) -> Result<Settings, ConfigError> {
        let mut settings = Settings::new().with_duration_field(&self.duration_field);
        if let Some(origin) = &self.origin {
            settings = settings.with_origin(origin);
        }

        for spec in &self.sinks {
            let options = SinkOptions::from(spec.options.clone());
            let sink: SharedSink = if spec.threaded {
                let backend = ThreadedBackend::with_registry(
                    SinkSource::named(spec.kind.as_str(), options),
                    self.threaded.clone(),
                    registry,
                )?;
                Arc::new(backend)
            } else {
                registry.build(&spec.kind, &options)?
            };
            settings = settings.with_backend(sink);
        }
        Ok(settings)
    }
}

fn parse_env<T: FromStr>(key: String, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

fn parse_secs(key: String, value: String) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_env(key.clone(), value.clone())?;
    secs_to_duration(secs).ok_or(ConfigError::InvalidEnv { key, value })
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Serde adapter for durations written as (fractional) seconds
pub(crate) mod duration_secs {
    use serde::{de, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        super::secs_to_duration(secs)
            .ok_or_else(|| de::Error::custom(format!("invalid duration {} seconds", secs)))
    }
}
