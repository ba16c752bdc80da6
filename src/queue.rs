//! Bounded Record Queue
//!
//! Fixed-capacity multi-producer/single-consumer queue between the
//! instrumented call sites and the batching worker. Producers never block:
//! `offer` either enqueues or hands the record back. The consumer blocks only
//! inside `poll`, bounded by a timeout, so it can wake up periodically to
//! re-check flush deadlines and owner liveness.
//!
//! The queue lives inside one process. A child created by `fork` after the
//! backend was built gets a copy of the queue without a worker thread;
//! backends should be built after forking.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

use crate::record::MetricRecord;

/// Errors from queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Capacity reached; the rejected record is handed back
    #[error("queue full, metric `{}` rejected", .0.name())]
    Full(MetricRecord),

    /// All producers or the consumer went away
    #[error("queue disconnected")]
    Disconnected,

    /// The queue primitive misbehaved
    #[error("queue corrupted: {0}")]
    Corrupted(String),
}

impl QueueError {
    /// Whether the error should stop the consumer
    pub fn is_fatal(&self) -> bool {
        !matches!(self, QueueError::Full(_))
    }
}

/// Queue shared by producers and exactly one consumer
pub trait RecordQueue: Send + Sync + 'static {
    /// Enqueue without blocking
    fn offer(&self, record: MetricRecord) -> Result<(), QueueError>;

    /// Dequeue one record, waiting at most `timeout`.
    ///
    /// `Ok(None)` means the wait timed out with nothing available.
    fn poll(&self, timeout: Duration) -> Result<Option<MetricRecord>, QueueError>;

    /// Records currently queued
    fn len(&self) -> usize;

    /// Fixed capacity
    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}

/// Crossbeam-backed bounded queue.
///
/// Holds both channel ends so that every clone of the owning `Arc` can
/// produce and the worker can consume.
#[derive(Debug)]
pub struct BoundedQueue {
    tx: Sender<MetricRecord>,
    rx: Receiver<MetricRecord>,
    capacity: usize,
}

impl BoundedQueue {
    /// Create a queue holding at most `capacity` records (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(capacity);
        BoundedQueue { tx, rx, capacity }
    }

    /// Remove and return everything currently queued
    pub fn drain(&self) -> Vec<MetricRecord> {
        self.rx.try_iter().collect()
    }
}

impl RecordQueue for BoundedQueue {
    #[inline]
    fn offer(&self, record: MetricRecord) -> Result<(), QueueError> {
        self.tx.try_send(record).map_err(|e| match e {
            TrySendError::Full(record) => QueueError::Full(record),
            TrySendError::Disconnected(_) => QueueError::Disconnected,
        })
    }

    fn poll(&self, timeout: Duration) -> Result<Option<MetricRecord>, QueueError> {
        match self.rx.recv_timeout(timeout) {
            Ok(record) => Ok(Some(record)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    fn len(&self) -> usize {
        self.rx.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn record(name: &str) -> MetricRecord {
        MetricRecord::new(name, fields! {})
    }

    #[test]
    fn test_offer_rejects_when_full() {
        let queue = BoundedQueue::new(2);

        queue.offer(record("a")).unwrap();
        queue.offer(record("b")).unwrap();
        assert!(queue.is_full());

        match queue.offer(record("c")) {
            Err(QueueError::Full(rejected)) => assert_eq!(rejected.name(), "c"),
            other => panic!("expected Full, got {:?}", other),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_poll_fifo() {
        let queue = BoundedQueue::new(4);
        for name in ["a", "b", "c"] {
            queue.offer(record(name)).unwrap();
        }

        let names: Vec<String> = (0..3)
            .map(|_| {
                queue
                    .poll(Duration::from_millis(10))
                    .unwrap()
                    .unwrap()
                    .name()
                    .to_string()
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_poll_times_out_empty() {
        let queue = BoundedQueue::new(4);
        let start = Instant::now();

        let polled = queue.poll(Duration::from_millis(50)).unwrap();

        assert!(polled.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let queue = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.offer(record("only")).is_ok());
    }

    #[test]
    fn test_multi_producer() {
        let queue = Arc::new(BoundedQueue::new(100));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = queue.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        q.offer(record(&format!("t{}.{}", t, i))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(queue.len(), 40);
        assert_eq!(queue.drain().len(), 40);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_is_not_fatal() {
        assert!(!QueueError::Full(record("m")).is_fatal());
        assert!(QueueError::Disconnected.is_fatal());
        assert!(QueueError::Corrupted("bad".into()).is_fatal());
    }
}
