//! Batching Worker
//!
//! Background loop that drains the record queue into an in-memory batch and
//! hands the batch to the wrapped sink when it is full or old enough.
//!
//! ## Loop
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   has work? ──no──▶ exit (LimitReached)                   │
//!            │yes                                           │
//!   batch >= bulk_size, or non-empty and                    │
//!   bulk_timeout elapsed? ──yes──▶ flush, reset clock       │
//!            │                                              │
//!   poll(queue_timeout)                                     │
//!     ├─ record  ──▶ push to batch, fetched += 1 ───────────┤
//!     ├─ timeout ──▶ owner alive? ──yes─────────────────────┘
//!     │                     └─no──▶ exit (OwnerGone)
//!     └─ error   ──▶ exit (QueueFailed)
//!
//!   on exit: flush remainder once, mark stopped
//! ```
//!
//! Delivery is at-most-once: a batch is cleared after every flush attempt,
//! whether the sink succeeded, returned an error or panicked.

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::observability::flush_span;
use crate::queue::RecordQueue;
use crate::record::MetricRecord;
use crate::sink::SharedSink;

/// Name of the worker thread
pub const WORKER_THREAD_NAME: &str = "time-execution-worker";

const NO_LIMIT: u64 = u64::MAX;

/// Flush thresholds and poll interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchConfig {
    /// Flush once the batch holds this many records
    pub bulk_size: usize,
    /// Flush a non-empty batch once this much time passed since the last flush
    pub bulk_timeout: Duration,
    /// Longest single wait on the queue; also the liveness heartbeat
    pub queue_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            bulk_size: 50,
            bulk_timeout: Duration::from_secs(1),
            queue_timeout: Duration::from_millis(500),
        }
    }
}

impl BatchConfig {
    pub fn with_bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = bulk_size.max(1);
        self
    }

    pub fn with_bulk_timeout(mut self, timeout: Duration) -> Self {
        self.bulk_timeout = timeout;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Whether `batch_len` records collected since `last_flush` must be flushed now
    #[inline]
    pub fn should_flush(&self, batch_len: usize, last_flush: Instant) -> bool {
        batch_len >= self.bulk_size
            || (batch_len > 0 && last_flush.elapsed() >= self.bulk_timeout)
    }
}

/// Token held by whoever owns the worker.
///
/// The worker only sees a [`LivenessWatch`]; once every `Liveness` is dropped
/// the worker exits at its next idle poll.
#[derive(Debug, Default)]
pub struct Liveness(Arc<()>);

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self) -> LivenessWatch {
        LivenessWatch(Arc::downgrade(&self.0))
    }
}

/// Worker side of [`Liveness`]
#[derive(Debug, Clone)]
pub struct LivenessWatch(Weak<()>);

impl LivenessWatch {
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Why the worker loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The configured item limit was reached
    LimitReached,
    /// Dequeue failed with a fatal error
    QueueFailed,
    /// The owner dropped its liveness token and the queue was idle
    OwnerGone,
}

/// Snapshot of worker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub fetched_items: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
}

/// Shared state of the (at most one) worker of a backend
#[derive(Debug)]
pub struct WorkerState {
    running: AtomicBool,
    fetched_items: AtomicU64,
    worker_limit: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    last_exit: Mutex<Option<ExitReason>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: Condvar,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new(None)
    }
}

impl WorkerState {
    pub fn new(worker_limit: Option<u64>) -> Self {
        WorkerState {
            running: AtomicBool::new(false),
            fetched_items: AtomicU64::new(0),
            worker_limit: AtomicU64::new(worker_limit.unwrap_or(NO_LIMIT)),
            flushes: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            last_exit: Mutex::new(None),
            handle: Mutex::new(None),
            stopped: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Records fetched since the current worker was started
    #[inline]
    pub fn fetched_items(&self) -> u64 {
        self.fetched_items.load(Ordering::SeqCst)
    }

    pub fn worker_limit(&self) -> Option<u64> {
        match self.worker_limit.load(Ordering::SeqCst) {
            NO_LIMIT => None,
            limit => Some(limit),
        }
    }

    /// Change the item limit; takes effect on the next loop iteration
    pub fn set_worker_limit(&self, limit: Option<u64>) {
        self.worker_limit
            .store(limit.unwrap_or(NO_LIMIT), Ordering::SeqCst);
    }

    pub fn last_exit(&self) -> Option<ExitReason> {
        *self.last_exit.lock()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            fetched_items: self.fetched_items(),
            flushes: self.flushes.load(Ordering::SeqCst),
            failed_flushes: self.failed_flushes.load(Ordering::SeqCst),
        }
    }

    /// Name of the live worker thread, if any
    pub fn thread_name(&self) -> Option<String> {
        self.handle
            .lock()
            .as_ref()
            .and_then(|h| h.thread().name().map(str::to_string))
    }

    #[inline]
    fn has_work(&self) -> bool {
        self.fetched_items() < self.worker_limit.load(Ordering::SeqCst)
    }

    /// Run `worker` on a new named thread unless one is already running.
    ///
    /// Returns `Ok(false)` when a worker was already running; the passed
    /// worker is then dropped without running.
    pub fn spawn(self: &Arc<Self>, worker: BatchingWorker) -> std::io::Result<bool> {
        let mut handle = self.handle.lock();
        if self.running.load(Ordering::SeqCst) {
            return Ok(false);
        }

        self.running.store(true, Ordering::SeqCst);
        self.fetched_items.store(0, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                worker.run();
            });

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                info!("metric worker started");
                Ok(true)
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Block until no worker is running, at most `timeout`.
    ///
    /// Returns whether the worker is stopped.
    /// A timeout too large to form a deadline waits without one.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut handle = self.handle.lock();
        while self.running.load(Ordering::SeqCst) {
            match deadline {
                Some(deadline) => {
                    if self.stopped.wait_until(&mut handle, deadline).timed_out() {
                        return !self.running.load(Ordering::SeqCst);
                    }
                }
                None => self.stopped.wait(&mut handle),
            }
        }
        true
    }

    fn begin(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn finish(&self, reason: ExitReason) {
        *self.last_exit.lock() = Some(reason);

        let mut handle = self.handle.lock();
        // Only clear the handle if it belongs to this thread, a newer worker may
        // already have been registered.
        let ours = handle
            .as_ref()
            .map(|h| h.thread().id() == thread::current().id())
            .unwrap_or(false);
        if ours {
            handle.take();
        }
        self.running.store(false, Ordering::SeqCst);
        self.stopped.notify_all();
    }
}

/// Drains the queue into batches and flushes them to the sink
pub struct BatchingWorker {
    queue: Arc<dyn RecordQueue>,
    sink: SharedSink,
    config: BatchConfig,
    state: Arc<WorkerState>,
    owner: LivenessWatch,
    respawn: bool,
}

impl BatchingWorker {
    pub fn new(
        queue: Arc<dyn RecordQueue>,
        sink: SharedSink,
        config: BatchConfig,
        state: Arc<WorkerState>,
        owner: LivenessWatch,
    ) -> Self {
        BatchingWorker {
            queue,
            sink,
            config,
            state,
            owner,
            respawn: false,
        }
    }

    /// After a limit exit, hand records still queued to a fresh worker.
    ///
    /// Used by lazily started backends, whose producers only restart the
    /// worker when they observe it stopped.
    pub fn respawn_on_pending(mut self, enabled: bool) -> Self {
        self.respawn = enabled;
        self
    }

    /// Run the loop on the current thread until a terminal condition
    pub fn run(self) -> ExitReason {
        self.state.begin();

        let mut batch: Vec<MetricRecord> = Vec::with_capacity(self.config.bulk_size);
        let mut last_flush = Instant::now();

        let reason = loop {
            if !self.state.has_work() {
                break ExitReason::LimitReached;
            }

            if self.config.should_flush(batch.len(), last_flush) {
                self.flush(&mut batch);
                last_flush = Instant::now();
            }

            match self.queue.poll(self.config.queue_timeout) {
                Ok(Some(record)) => {
                    self.state.fetched_items.fetch_add(1, Ordering::SeqCst);
                    batch.push(record);
                }
                Ok(None) => {
                    if !self.owner.is_alive() {
                        break ExitReason::OwnerGone;
                    }
                }
                Err(e) => {
                    warn!("stopping the worker due to {}", e);
                    break ExitReason::QueueFailed;
                }
            }
        };

        if !batch.is_empty() {
            self.flush(&mut batch);
        }

        info!(reason = ?reason, fetched = self.state.fetched_items(), "metric worker stopped");
        self.state.finish(reason);

        if self.respawn
            && reason == ExitReason::LimitReached
            && self.state.worker_limit() != Some(0)
            && !self.queue.is_empty()
            && self.owner.is_alive()
        {
            let state = self.state.clone();
            if let Err(e) = state.spawn(self) {
                warn!("failed to respawn metric worker: {}", e);
            }
        }
        reason
    }

    fn flush(&self, batch: &mut Vec<MetricRecord>) {
        let _span = flush_span(batch.len()).entered();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.sink.bulk_write(batch)));
        match outcome {
            Ok(Ok(())) => {
                self.state.flushes.fetch_add(1, Ordering::SeqCst);
                debug!(count = batch.len(), "flushed metrics");
            }
            Ok(Err(e)) => {
                self.state.failed_flushes.fetch_add(1, Ordering::SeqCst);
                warn!("{:?} write failure {}", self.sink, e);
            }
            Err(_) => {
                self.state.failed_flushes.fetch_add(1, Ordering::SeqCst);
                warn!("{:?} write failure: sink panicked", self.sink);
            }
        }
        batch.clear();
    }
}
