//! Threaded Backend
//!
//! The sink applications actually register. `write` stamps the record and
//! offers it to a bounded queue without blocking; a single background worker
//! drains the queue and forwards batches to the wrapped sink.
//!
//! ```text
//! caller ──write──▶ ThreadedBackend ──offer──▶ BoundedQueue
//!                                                   │ poll
//!                                                   ▼
//!                   wrapped sink ◀──bulk_write── BatchingWorker
//! ```
//!
//! A full queue drops the newest record with a warning. Nothing on this path
//! ever returns an error to the caller.

use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::duration_secs;
use crate::queue::{BoundedQueue, QueueError, RecordQueue};
use crate::record::{Fields, MetricRecord};
use crate::sink::{MetricSink, SharedSink, SinkError, SinkOptions, SinkRegistry};
use crate::worker::{BatchConfig, BatchingWorker, ExitReason, Liveness, WorkerState, WorkerStats};

/// Errors building a threaded backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to build sink: {0}")]
    Sink(#[from] SinkError),

    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Threaded backend settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThreadedConfig {
    /// Queue capacity
    pub queue_maxsize: usize,
    /// Longest single wait on the queue, in seconds
    #[serde(with = "duration_secs")]
    pub queue_timeout: Duration,
    /// Flush once this many records are batched
    pub bulk_size: usize,
    /// Flush a non-empty batch after this many seconds
    #[serde(with = "duration_secs")]
    pub bulk_timeout: Duration,
    /// Stop the worker after this many records (testing aid)
    pub worker_limit: Option<u64>,
    /// Start the worker on first write instead of at construction
    pub lazy_init: bool,
    /// How long drop waits for the worker to drain, in seconds
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for ThreadedConfig {
    fn default() -> Self {
        let batch = BatchConfig::default();
        ThreadedConfig {
            queue_maxsize: 1000,
            queue_timeout: batch.queue_timeout,
            bulk_size: batch.bulk_size,
            bulk_timeout: batch.bulk_timeout,
            worker_limit: None,
            lazy_init: false,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl ThreadedConfig {
    pub fn with_queue_maxsize(mut self, size: usize) -> Self {
        self.queue_maxsize = size;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_bulk_size(mut self, size: usize) -> Self {
        self.bulk_size = size;
        self
    }

    pub fn with_bulk_timeout(mut self, timeout: Duration) -> Self {
        self.bulk_timeout = timeout;
        self
    }

    pub fn with_worker_limit(mut self, limit: Option<u64>) -> Self {
        self.worker_limit = limit;
        self
    }

    pub fn with_lazy_init(mut self, lazy: bool) -> Self {
        self.lazy_init = lazy;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::default()
            .with_bulk_size(self.bulk_size)
            .with_bulk_timeout(self.bulk_timeout)
            .with_queue_timeout(self.queue_timeout)
    }
}

/// How the wrapped sink is obtained
pub enum SinkSource {
    /// An already constructed sink
    Instance(SharedSink),
    /// Built once, at backend construction
    Factory(Box<dyn FnOnce() -> Result<SharedSink, SinkError> + Send>),
    /// Looked up by kind in a [`SinkRegistry`]
    Named { kind: String, options: SinkOptions },
}

impl SinkSource {
    pub fn instance(sink: impl MetricSink) -> Self {
        SinkSource::Instance(Arc::new(sink))
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: FnOnce() -> Result<SharedSink, SinkError> + Send + 'static,
    {
        SinkSource::Factory(Box::new(factory))
    }

    pub fn named(kind: impl Into<String>, options: SinkOptions) -> Self {
        SinkSource::Named {
            kind: kind.into(),
            options,
        }
    }

    fn resolve(self, registry: &SinkRegistry) -> Result<SharedSink, SinkError> {
        match self {
            SinkSource::Instance(sink) => Ok(sink),
            SinkSource::Factory(factory) => factory(),
            SinkSource::Named { kind, options } => registry.build(&kind, &options),
        }
    }
}

impl From<SharedSink> for SinkSource {
    fn from(sink: SharedSink) -> Self {
        SinkSource::Instance(sink)
    }
}

impl fmt::Debug for SinkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkSource::Instance(sink) => f.debug_tuple("Instance").field(sink).finish(),
            SinkSource::Factory(_) => f.write_str("Factory(..)"),
            SinkSource::Named { kind, options } => f
                .debug_struct("Named")
                .field("kind", kind)
                .field("options", options)
                .finish(),
        }
    }
}

/// Non-blocking sink facade backed by a queue and one worker thread
pub struct ThreadedBackend {
    sink: SharedSink,
    queue: Arc<BoundedQueue>,
    state: Arc<WorkerState>,
    batch: Mutex<BatchConfig>,
    liveness: Option<Liveness>,
    lazy_init: bool,
    shutdown_grace: Duration,
    dropped: AtomicU64,
}

impl ThreadedBackend {
    /// Build a backend resolving named sinks through [`SinkRegistry::builtin`]
    pub fn new(source: impl Into<SinkSource>, config: ThreadedConfig) -> Result<Self, BackendError> {
        Self::with_registry(source, config, &SinkRegistry::builtin())
    }

    /// Build a backend resolving named sinks through `registry`
    pub fn with_registry(
        source: impl Into<SinkSource>,
        config: ThreadedConfig,
        registry: &SinkRegistry,
    ) -> Result<Self, BackendError> {
        let sink = source.into().resolve(registry)?;

        let backend = ThreadedBackend {
            sink,
            queue: Arc::new(BoundedQueue::new(config.queue_maxsize)),
            state: Arc::new(WorkerState::new(config.worker_limit)),
            batch: Mutex::new(config.batch_config()),
            liveness: Some(Liveness::new()),
            lazy_init: config.lazy_init,
            shutdown_grace: config.shutdown_grace,
            dropped: AtomicU64::new(0),
        };

        if !config.lazy_init {
            backend.try_start()?;
        }
        Ok(backend)
    }

    /// Enqueue a metric without blocking.
    ///
    /// Stamps a UTC timestamp unless `fields` carries one. When the queue is
    /// full the metric is logged and discarded.
    pub fn write(&self, name: &str, fields: Fields) {
        self.enqueue(MetricRecord::new(name, fields));
    }

    fn enqueue(&self, record: MetricRecord) {
        if self.lazy_init && !self.state.is_running() {
            self.start();
        }

        match self.queue.offer(record) {
            Ok(()) => {
                // The worker may have stopped between the check above and the offer
                if self.lazy_init && !self.state.is_running() {
                    self.start();
                }
            }
            Err(QueueError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Discard metric {}", record.name());
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Discard metric: {}", e);
            }
        }
    }

    /// Start the worker if none is running; returns whether one was started
    pub fn start(&self) -> bool {
        match self.try_start() {
            Ok(started) => started,
            Err(e) => {
                error!("failed to start metric worker: {}", e);
                false
            }
        }
    }

    fn try_start(&self) -> Result<bool, BackendError> {
        let owner = match self.liveness {
            Some(ref liveness) => liveness.watch(),
            None => return Ok(false),
        };
        let worker = BatchingWorker::new(
            self.queue.clone(),
            self.sink.clone(),
            *self.batch.lock(),
            self.state.clone(),
            owner,
        )
        .respawn_on_pending(self.lazy_init);
        Ok(self.state.spawn(worker)?)
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Records fetched by the current worker since it started
    pub fn fetched_items(&self) -> u64 {
        self.state.fetched_items()
    }

    /// Records waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_queue_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Records discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Change the worker item limit; `Some(0)` stops the worker at its next iteration
    pub fn set_worker_limit(&self, limit: Option<u64>) {
        self.state.set_worker_limit(limit);
    }

    /// Thresholds used by the next started worker
    pub fn set_batch_config(&self, config: BatchConfig) {
        *self.batch.lock() = config;
    }

    pub fn batch_config(&self) -> BatchConfig {
        *self.batch.lock()
    }

    /// Wait at most `timeout` for the worker to stop
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.state.wait_stopped(timeout)
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.state.stats()
    }

    pub fn last_exit(&self) -> Option<ExitReason> {
        self.state.last_exit()
    }

    pub fn thread_name(&self) -> Option<String> {
        self.state.thread_name()
    }

    /// The wrapped sink
    pub fn inner(&self) -> &SharedSink {
        &self.sink
    }
}

impl MetricSink for ThreadedBackend {
    fn write(&self, name: &str, fields: Fields) -> Result<(), SinkError> {
        ThreadedBackend::write(self, name, fields);
        Ok(())
    }

    fn bulk_write(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        for record in records {
            self.enqueue(record.clone());
        }
        Ok(())
    }
}

impl fmt::Debug for ThreadedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedBackend")
            .field("sink", &self.sink)
            .field("queued", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .field("running", &self.state.is_running())
            .finish()
    }
}

impl Drop for ThreadedBackend {
    fn drop(&mut self) {
        // Releasing the token lets the worker exit once the queue is drained.
        self.liveness.take();
        if self.state.is_running() && !self.state.wait_stopped(self.shutdown_grace) {
            warn!(
                queued = self.queue.len(),
                "metric worker still draining after {:?}", self.shutdown_grace
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::sink::MemorySink;

    fn quick() -> ThreadedConfig {
        ThreadedConfig::default()
            .with_queue_maxsize(10)
            .with_queue_timeout(Duration::from_millis(20))
            .with_bulk_size(5)
            .with_bulk_timeout(Duration::from_millis(40))
    }

    #[test]
    fn test_config_defaults() {
        let config = ThreadedConfig::default();

        assert_eq!(config.queue_maxsize, 1000);
        assert_eq!(config.queue_timeout, Duration::from_millis(500));
        assert_eq!(config.bulk_size, 50);
        assert_eq!(config.bulk_timeout, Duration::from_secs(1));
        assert!(!config.lazy_init);
    }

    #[test]
    fn test_config_from_toml_seconds() {
        let config: ThreadedConfig = toml::from_str(
            r#"
            queue_maxsize = 10
            queue_timeout = 0.1
            bulk_timeout = 2
            lazy_init = true
            "#,
        )
        .unwrap();

        assert_eq!(config.queue_maxsize, 10);
        assert_eq!(config.queue_timeout, Duration::from_millis(100));
        assert_eq!(config.bulk_timeout, Duration::from_secs(2));
        assert_eq!(config.bulk_size, 50);
        assert!(config.lazy_init);
    }

    #[test]
    fn test_starts_eagerly() {
        let sink = Arc::new(MemorySink::new());
        let backend = ThreadedBackend::new(SinkSource::Instance(sink), quick()).unwrap();

        assert!(backend.is_running());
        assert_eq!(
            backend.thread_name().as_deref(),
            Some(crate::worker::WORKER_THREAD_NAME)
        );
    }

    #[test]
    fn test_lazy_starts_on_write() {
        let sink = Arc::new(MemorySink::new());
        let backend =
            ThreadedBackend::new(SinkSource::Instance(sink), quick().with_lazy_init(true)).unwrap();

        assert!(!backend.is_running());
        backend.write("m", fields! {});
        assert!(backend.is_running());
    }

    #[test]
    fn test_factory_called_once() {
        let built = Arc::new(AtomicU64::new(0));
        let counter = built.clone();

        let backend = ThreadedBackend::new(
            SinkSource::factory(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(MemorySink::new()) as SharedSink)
            }),
            quick(),
        )
        .unwrap();

        backend.write("m", fields! {});
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_factory_failure_is_error() {
        let result = ThreadedBackend::new(
            SinkSource::factory(|| Err(SinkError::Unavailable("no brokers".into()))),
            quick(),
        );

        assert!(matches!(result, Err(BackendError::Sink(_))));
    }

    #[test]
    fn test_named_sink() {
        let backend = ThreadedBackend::new(SinkSource::named("memory", SinkOptions::new()), quick())
            .unwrap();
        assert!(format!("{:?}", backend.inner()).contains("MemorySink"));

        let missing = ThreadedBackend::new(SinkSource::named("kafka", SinkOptions::new()), quick());
        assert!(missing.is_err());
    }

    #[test]
    fn test_drop_with_unbounded_grace() {
        let sink = Arc::new(MemorySink::new());
        let backend = ThreadedBackend::new(
            SinkSource::Instance(sink.clone()),
            quick().with_shutdown_grace(Duration::from_secs(u64::MAX)),
        )
        .unwrap();
        backend.write("last", fields! {});

        drop(backend);

        assert_eq!(sink.record_count(), 1);
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let sink = Arc::new(MemorySink::new());
        let backend =
            ThreadedBackend::new(SinkSource::Instance(sink), quick().with_queue_maxsize(3)).unwrap();
        backend.set_worker_limit(Some(0));
        assert!(backend.wait_stopped(Duration::from_secs(1)));

        for i in 0..5 {
            backend.write(&format!("m{}", i), fields! {});
        }

        assert_eq!(backend.queued(), 3);
        assert_eq!(backend.dropped(), 2);
    }
}
