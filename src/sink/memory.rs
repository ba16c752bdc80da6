//! In-memory recording sink for tests and local inspection.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{MetricSink, SinkError};
use crate::record::{Fields, MetricRecord};

/// One observed call into the sink
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Write(MetricRecord),
    Bulk(Vec<MetricRecord>),
}

/// Sink that keeps every call it receives.
///
/// Can be armed with [`MemorySink::fail_with`] so that every call returns an
/// error after being recorded, which is how flush failure handling is tested.
#[derive(Debug, Default)]
pub struct MemorySink {
    calls: Mutex<Vec<SinkCall>>,
    failure: Mutex<Option<String>>,
    panic_on_write: AtomicBool,
    write_count: AtomicU64,
    record_count: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with `SinkError::Unavailable(reason)`
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    /// Make every following call panic
    pub fn panic_on_write(&self, enabled: bool) {
        self.panic_on_write.store(enabled, Ordering::SeqCst);
    }

    /// Stop failing
    pub fn recover(&self) {
        *self.failure.lock() = None;
        self.panic_on_write.store(false, Ordering::SeqCst);
    }

    /// All calls in arrival order
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().clone()
    }

    /// Batches received through `bulk_write`
    pub fn bulk_calls(&self) -> Vec<Vec<MetricRecord>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SinkCall::Bulk(batch) => Some(batch.clone()),
                SinkCall::Write(_) => None,
            })
            .collect()
    }

    /// Every record received by either method, flattened in arrival order
    pub fn records(&self) -> Vec<MetricRecord> {
        let calls = self.calls.lock();
        let mut records = Vec::new();
        for call in calls.iter() {
            match call {
                SinkCall::Write(record) => records.push(record.clone()),
                SinkCall::Bulk(batch) => records.extend(batch.iter().cloned()),
            }
        }
        records
    }

    /// Records with the given metric name
    pub fn records_named(&self, name: &str) -> Vec<MetricRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.name() == name)
            .collect()
    }

    /// Number of `write` calls
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Total records seen across all calls
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
        self.write_count.store(0, Ordering::SeqCst);
        self.record_count.store(0, Ordering::SeqCst);
    }

    fn outcome(&self) -> Result<(), SinkError> {
        if self.panic_on_write.load(Ordering::SeqCst) {
            panic!("memory sink armed to panic");
        }
        match self.failure.lock().as_ref() {
            Some(reason) => Err(SinkError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl MetricSink for MemorySink {
    fn write(&self, name: &str, fields: Fields) -> Result<(), SinkError> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        self.record_count.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .push(SinkCall::Write(MetricRecord::new(name, fields)));
        self.outcome()
    }

    fn bulk_write(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        self.record_count
            .fetch_add(records.len() as u64, Ordering::SeqCst);
        self.calls.lock().push(SinkCall::Bulk(records.to_vec()));
        self.outcome()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    #[test]
    fn test_records_calls_in_order() {
        let sink = MemorySink::new();

        sink.write("first", fields! { "value" => 1 }).unwrap();
        sink.bulk_write(&[
            MetricRecord::new("second", fields! {}),
            MetricRecord::new("third", fields! {}),
        ])
        .unwrap();

        let names: Vec<_> = sink
            .records()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert_eq!(sink.write_count(), 1);
        assert_eq!(sink.record_count(), 3);
        assert_eq!(sink.bulk_calls().len(), 1);
    }

    #[test]
    fn test_fail_with_still_records() {
        let sink = MemorySink::new();
        sink.fail_with("store down");

        let err = sink.bulk_write(&[MetricRecord::new("m", fields! {})]);
        assert!(matches!(err, Err(SinkError::Unavailable(ref r)) if r == "store down"));
        assert_eq!(sink.record_count(), 1);

        sink.recover();
        assert!(sink.write("m", fields! {}).is_ok());
    }

    #[test]
    fn test_clear() {
        let sink = MemorySink::new();
        sink.write("m", fields! {}).unwrap();

        sink.clear();
        assert!(sink.calls().is_empty());
        assert_eq!(sink.record_count(), 0);
    }
}
