//! Instrumentation Settings
//!
//! [`Settings`] is a plain value listing the sinks metrics fan out to, the
//! enrichment hooks, the duration field name and an optional origin tag.
//! Code that wants a process-wide "current settings" shares a
//! [`SettingsHandle`]: readers take a cheap `Arc` snapshot, writers swap the
//! whole value atomically.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use crate::record::Fields;
use crate::sink::{MetricSink, SharedSink};
use crate::timed::{Hook, SharedHook};

/// Default field name for call durations
pub const DEFAULT_DURATION_FIELD: &str = "value";

#[derive(Clone)]
pub struct Settings {
    /// Sinks every metric is written to, in order
    pub backends: Vec<SharedSink>,
    /// Hooks applied to every timed call
    pub hooks: Vec<SharedHook>,
    /// Field name the duration in milliseconds is stored under
    pub duration_field: String,
    /// Added as `origin` to every timed metric when set
    pub origin: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            backends: Vec::new(),
            hooks: Vec::new(),
            duration_field: DEFAULT_DURATION_FIELD.to_string(),
            origin: None,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: SharedSink) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn with_hook(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn with_duration_field(mut self, field: &str) -> Self {
        self.duration_field = field.to_string();
        self
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    /// Write a metric to every backend.
    ///
    /// Backend errors and panics are logged and swallowed.
    pub fn write_metric(&self, name: &str, fields: Fields) {
        for backend in &self.backends {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| backend.write(name, fields.clone())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{:?} write failure {}", backend, e),
                Err(_) => warn!("{:?} write failure: sink panicked", backend),
            }
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("backends", &self.backends)
            .field("hooks", &self.hooks.len())
            .field("duration_field", &self.duration_field)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Shared, swappable reference to the current [`Settings`]
#[derive(Clone, Default)]
pub struct SettingsHandle {
    current: Arc<RwLock<Arc<Settings>>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        SettingsHandle {
            current: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// Snapshot of the current settings
    pub fn current(&self) -> Arc<Settings> {
        self.current.read().clone()
    }

    /// Replace the settings, returning the previous value
    pub fn configure(&self, settings: Settings) -> Arc<Settings> {
        std::mem::replace(&mut *self.current.write(), Arc::new(settings))
    }

    /// Replace the settings until the returned guard is dropped
    pub fn scoped(&self, settings: Settings) -> ScopedSettings {
        let previous = self.configure(settings);
        ScopedSettings {
            handle: self.clone(),
            previous: Some(previous),
        }
    }

    /// Write a metric through the current settings
    pub fn write_metric(&self, name: &str, fields: Fields) {
        self.current().write_metric(name, fields);
    }
}

impl fmt::Debug for SettingsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SettingsHandle")
            .field(&*self.current.read())
            .finish()
    }
}

/// Restores the previous settings on drop
#[must_use = "settings are restored as soon as the guard is dropped"]
pub struct ScopedSettings {
    handle: SettingsHandle,
    previous: Option<Arc<Settings>>,
}

impl Drop for ScopedSettings {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.handle.current.write() = previous;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::sink::{MemorySink, SinkError};
    use crate::record::MetricRecord;

    #[derive(Debug)]
    struct FailingSink;

    impl MetricSink for FailingSink {
        fn write(&self, _name: &str, _fields: Fields) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }

        fn bulk_write(&self, _records: &[MetricRecord]) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_fan_out_to_all_backends() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let settings = Settings::new()
            .with_backend(first.clone())
            .with_backend(second.clone());

        settings.write_metric("m", fields! { "value" => 1 });

        assert_eq!(first.write_count(), 1);
        assert_eq!(second.write_count(), 1);
    }

    #[test]
    fn test_failing_backend_does_not_stop_fan_out() {
        let memory = Arc::new(MemorySink::new());
        let panicking = Arc::new(MemorySink::new());
        panicking.panic_on_write(true);

        let settings = Settings::new()
            .with_backend(Arc::new(FailingSink))
            .with_backend(panicking)
            .with_backend(memory.clone());

        settings.write_metric("m", fields! {});
        assert_eq!(memory.write_count(), 1);
    }

    #[test]
    fn test_configure_swaps() {
        let handle = SettingsHandle::default();
        assert_eq!(handle.current().duration_field, "value");

        let previous = handle.configure(Settings::new().with_duration_field("ms"));
        assert_eq!(previous.duration_field, "value");
        assert_eq!(handle.current().duration_field, "ms");
    }

    #[test]
    fn test_scoped_restores() {
        let handle = SettingsHandle::new(Settings::new().with_origin("outer"));

        {
            let _guard = handle.scoped(Settings::new().with_origin("inner"));
            assert_eq!(handle.current().origin.as_deref(), Some("inner"));
        }

        assert_eq!(handle.current().origin.as_deref(), Some("outer"));
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let handle = SettingsHandle::new(Settings::new().with_origin("old"));
        let snapshot = handle.current();

        handle.configure(Settings::new().with_origin("new"));

        assert_eq!(snapshot.origin.as_deref(), Some("old"));
    }
}
