//! Non-blocking metric delivery for timed calls.
//!
//! Recording a metric happens on every instrumented call and must be cheap;
//! persisting it is slow and unreliable. [`ThreadedBackend`] separates the
//! two: `write` offers the record to a bounded queue and returns, a single
//! background [`worker`] batches records and flushes them to the wrapped
//! [`MetricSink`]. A full queue drops metrics, a failing sink loses the batch,
//! and neither ever reaches the instrumented code.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use time_execution::{
//!     fqn, time_execution, SettingsHandle, Settings, SinkSource, ThreadedBackend, ThreadedConfig,
//! };
//! use time_execution::sink::LogSink;
//!
//! let backend = ThreadedBackend::new(SinkSource::instance(LogSink::default()), ThreadedConfig::default())
//!     .expect("backend");
//! let settings = SettingsHandle::new(Settings::new().with_backend(Arc::new(backend)));
//!
//! let answer = time_execution(&settings, &fqn!("compute"), || 6 * 7);
//! assert_eq!(answer, 42);
//! ```

pub mod backend;
pub mod config;
pub mod observability;
pub mod queue;
pub mod record;
pub mod settings;
pub mod sink;
pub mod timed;
pub mod worker;

pub use backend::{BackendError, SinkSource, ThreadedBackend, ThreadedConfig};
pub use config::{ConfigError, PipelineConfig, SinkSpec};
pub use queue::{BoundedQueue, QueueError, RecordQueue};
pub use record::{FieldValue, Fields, MetricRecord};
pub use settings::{Settings, SettingsHandle};
pub use sink::{MetricSink, SharedSink, SinkError, SinkRegistry};
pub use timed::{
    entry_hook, hook, on_exit, time_execution, time_execution_async, try_time_execution,
    try_time_execution_async, Hook, HookContext, HookGuard, Timed, TimedOptions,
};
pub use worker::{BatchConfig, BatchingWorker, ExitReason, WorkerState};
