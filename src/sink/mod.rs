//! Metric Sinks
//!
//! A sink is anything that can persist metric records. The contract has two
//! methods, `write` for a single metric and `bulk_write` for a batch. The
//! default implementations fail with [`SinkError::Unimplemented`] so a sink
//! that forgets to override one of them is noticed on first use instead of
//! silently losing data.
//!
//! Built-in sinks:
//! - [`MemorySink`]: records every call for verification
//! - [`JsonLinesSink`]: one JSON object per line on any writer
//! - [`LogSink`]: structured `tracing` events
//! - `DogStatsdSink`: timings over UDP (feature `statsd`)

mod json;
mod log;
mod memory;
pub mod registry;
#[cfg(feature = "statsd")]
mod statsd;

use std::fmt::Debug;
use std::sync::Arc;

use crate::record::{Fields, MetricRecord};

pub use self::json::JsonLinesSink;
pub use self::log::LogSink;
pub use self::memory::{MemorySink, SinkCall};
pub use self::registry::{SinkFactory, SinkOptions, SinkRegistry};
#[cfg(feature = "statsd")]
pub use self::statsd::DogStatsdSink;

/// Errors reported by a sink
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The sink does not provide this method
    #[error("{method} is not implemented by this sink")]
    Unimplemented { method: &'static str },

    #[error("sink I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize metric: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The remote store cannot be reached
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// The store refused the data or the sink was misconfigured
    #[error("sink rejected metrics: {0}")]
    Rejected(String),
}

/// Destination for metric records.
///
/// Sinks are shared behind `Arc`, so methods take `&self`; sinks with mutable
/// state use interior locking.
pub trait MetricSink: Debug + Send + Sync + 'static {
    /// Persist a single metric
    fn write(&self, name: &str, fields: Fields) -> Result<(), SinkError> {
        let _ = (name, fields);
        Err(SinkError::Unimplemented { method: "write" })
    }

    /// Persist a batch of metrics in one call
    fn bulk_write(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        let _ = records;
        Err(SinkError::Unimplemented {
            method: "bulk_write",
        })
    }
}

/// Arc wrapper for trait object usage
pub type SharedSink = Arc<dyn MetricSink>;

impl<S: MetricSink + ?Sized> MetricSink for Arc<S> {
    #[inline]
    fn write(&self, name: &str, fields: Fields) -> Result<(), SinkError> {
        (**self).write(name, fields)
    }

    #[inline]
    fn bulk_write(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        (**self).bulk_write(records)
    }
}

impl<S: MetricSink + ?Sized> MetricSink for Box<S> {
    #[inline]
    fn write(&self, name: &str, fields: Fields) -> Result<(), SinkError> {
        (**self).write(name, fields)
    }

    #[inline]
    fn bulk_write(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        (**self).bulk_write(records)
    }
}
