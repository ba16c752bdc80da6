//! Sink Registry
//!
//! Maps a sink kind (`"memory"`, `"jsonl"`, ...) to a factory that builds the
//! sink from keyword options. Populated explicitly at startup; configuration
//! files refer to sinks by kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::Level;

use super::{JsonLinesSink, LogSink, MemorySink, SharedSink, SinkError};

/// Keyword options passed to a sink factory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkOptions(toml::Table);

impl SinkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern - set an option
    pub fn with(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(toml::Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(toml::Value::as_integer)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(toml::Value::as_bool)
    }

    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(toml::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A required string option
    pub fn require_str(&self, key: &str) -> Result<&str, SinkError> {
        self.get_str(key)
            .ok_or_else(|| SinkError::Rejected(format!("missing option `{}`", key)))
    }
}

impl From<toml::Table> for SinkOptions {
    fn from(table: toml::Table) -> Self {
        SinkOptions(table)
    }
}

/// Builds a sink from its options
pub type SinkFactory = Arc<dyn Fn(&SinkOptions) -> Result<SharedSink, SinkError> + Send + Sync>;

/// Registry of sink factories keyed by kind
#[derive(Clone, Default)]
pub struct SinkRegistry {
    factories: HashMap<String, SinkFactory>,
}

impl SinkRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the sinks shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register("memory", |_opts: &SinkOptions| {
            Ok(Arc::new(MemorySink::new()) as SharedSink)
        });

        registry.register("log", |opts: &SinkOptions| {
            let level = match opts.get_str("level") {
                Some(raw) => raw
                    .parse::<Level>()
                    .map_err(|_| SinkError::Rejected(format!("unknown log level `{}`", raw)))?,
                None => Level::INFO,
            };
            Ok(Arc::new(LogSink::new(level)) as SharedSink)
        });

        registry.register("jsonl", |opts: &SinkOptions| {
            let path = opts.require_str("path")?;
            Ok(Arc::new(JsonLinesSink::create(path)) as SharedSink)
        });

        #[cfg(feature = "statsd")]
        registry.register("statsd", |opts: &SinkOptions| {
            let sink = super::DogStatsdSink::new(
                opts.get_str("addr").unwrap_or("127.0.0.1:8125"),
                opts.get_str("prefix").unwrap_or(""),
                opts.get_str("duration_field").unwrap_or("value"),
                opts.get_str_list("tags"),
            );
            Ok(Arc::new(sink) as SharedSink)
        });

        registry
    }

    /// Register (or replace) the factory for `kind`
    pub fn register<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(&SinkOptions) -> Result<SharedSink, SinkError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Build a sink of `kind` from `options`
    pub fn build(&self, kind: &str, options: &SinkOptions) -> Result<SharedSink, SinkError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| SinkError::Rejected(format!("unknown sink kind `{}`", kind)))?;
        factory(options)
    }
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    #[test]
    fn test_builtin_kinds() {
        let registry = SinkRegistry::builtin();

        assert!(registry.contains("memory"));
        assert!(registry.contains("log"));
        assert!(registry.contains("jsonl"));
    }

    #[test]
    fn test_unknown_kind() {
        let registry = SinkRegistry::builtin();
        let err = registry.build("influx", &SinkOptions::new()).unwrap_err();

        assert!(err.to_string().contains("unknown sink kind `influx`"));
    }

    #[test]
    fn test_log_level_option() {
        let registry = SinkRegistry::builtin();

        let ok = registry.build("log", &SinkOptions::new().with("level", "debug"));
        assert!(ok.is_ok());

        let bad = registry.build("log", &SinkOptions::new().with("level", "loud"));
        assert!(bad.is_err());
    }

    #[test]
    fn test_jsonl_requires_path() {
        let registry = SinkRegistry::builtin();
        assert!(registry.build("jsonl", &SinkOptions::new()).is_err());
    }

    #[test]
    fn test_custom_factory() {
        let shared = Arc::new(MemorySink::new());
        let captured = shared.clone();

        let mut registry = SinkRegistry::new();
        registry.register("captured", move |_opts: &SinkOptions| {
            Ok(captured.clone() as SharedSink)
        });

        let sink = registry.build("captured", &SinkOptions::new()).unwrap();
        sink.write("m", fields! {}).unwrap();
        assert_eq!(shared.write_count(), 1);
    }

    #[test]
    fn test_options_getters() {
        let opts = SinkOptions::new()
            .with("path", "/tmp/x")
            .with("port", 8125)
            .with("udp", true)
            .with("tags", vec!["a:1", "b:2"]);

        assert_eq!(opts.get_str("path"), Some("/tmp/x"));
        assert_eq!(opts.get_int("port"), Some(8125));
        assert_eq!(opts.get_bool("udp"), Some(true));
        assert_eq!(opts.get_str_list("tags"), vec!["a:1", "b:2"]);
        assert!(opts.require_str("missing").is_err());
    }
}
