//! Threaded Backend Tests
//!
//! End-to-end behaviour of the queue + worker pipeline against an in-memory
//! sink:
//! - Congestion drops metrics instead of blocking
//! - Batches never exceed the bulk size
//! - Sink failures never reach the producer
//! - Dropping the backend drains what is queued

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use time_execution::sink::MemorySink;
use time_execution::worker::WORKER_THREAD_NAME;
use time_execution::{
    fields, fqn, time_execution, ExitReason, FieldValue, Settings, SettingsHandle, SinkSource,
    ThreadedBackend, ThreadedConfig,
};

fn quick_config() -> ThreadedConfig {
    ThreadedConfig::default()
        .with_queue_maxsize(10)
        .with_queue_timeout(Duration::from_millis(20))
        .with_bulk_size(5)
        .with_bulk_timeout(Duration::from_millis(100))
}

fn backend_with(config: ThreadedConfig) -> (ThreadedBackend, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let backend = ThreadedBackend::new(SinkSource::Instance(sink.clone()), config).unwrap();
    (backend, sink)
}

/// Poll `cond` until it holds or `timeout` elapses
fn eventually(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_congested_queue_drops_then_resumes() {
    let (backend, sink) = backend_with(quick_config());

    backend.set_worker_limit(Some(0));
    assert!(backend.wait_stopped(Duration::from_secs(2)));
    assert_eq!(backend.last_exit(), Some(ExitReason::LimitReached));

    for i in 0..12 {
        backend.write("congested", fields! { "i" => i });
    }
    assert_eq!(backend.queued(), 10);
    assert_eq!(backend.dropped(), 2);
    assert!(backend.is_queue_full());

    backend.set_worker_limit(None);
    assert!(backend.start());
    assert!(eventually(Duration::from_secs(2), || sink.record_count() == 10));

    let batches = sink.bulk_calls();
    assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 5), "{:?}", batches);
    assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 10);

    // Retained metrics are the first ten, in order
    let order: Vec<f64> = sink
        .records()
        .iter()
        .filter_map(|r| r.get("i").and_then(FieldValue::as_f64))
        .collect();
    assert_eq!(order, (0..10).map(f64::from).collect::<Vec<_>>());
}

#[test]
fn test_timed_call_delivered_through_settings() {
    let (backend, sink) = backend_with(quick_config());
    let handle = SettingsHandle::new(Settings::new().with_backend(Arc::new(backend)));

    let name = fqn!("lookup");
    let out = time_execution(&handle, &name, || "found");
    assert_eq!(out, "found");

    assert!(eventually(Duration::from_secs(2), || sink.record_count() == 1));
    let record = &sink.records()[0];
    assert_eq!(record.name(), name);
    assert!(record.get("value").and_then(FieldValue::as_f64).is_some());
    assert!(record.get("hostname").is_some());
    assert!(record.timestamp().is_some());
}

#[test]
fn test_start_is_idempotent() {
    let (backend, _sink) = backend_with(quick_config());

    assert!(backend.is_running());
    assert!(!backend.start());
    assert!(!backend.start());
    assert_eq!(backend.thread_name().as_deref(), Some(WORKER_THREAD_NAME));
}

#[test]
fn test_lazy_backend_starts_on_first_write() {
    let (backend, sink) = backend_with(quick_config().with_lazy_init(true));

    assert!(!backend.is_running());
    assert_eq!(backend.thread_name(), None);

    backend.write("first", fields! {});

    assert!(backend.is_running());
    assert!(eventually(Duration::from_secs(2), || sink.record_count() == 1));
}

#[test]
fn test_concurrent_start_spawns_one_worker() {
    let (backend, _sink) = backend_with(quick_config().with_lazy_init(true));
    let backend = Arc::new(backend);

    for _round in 0..5 {
        let barrier = Arc::new(Barrier::new(8));
        let starters: Vec<_> = (0..8)
            .map(|_| {
                let backend = backend.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    backend.start()
                })
            })
            .collect();
        let started = starters
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|&s| s)
            .count();

        assert_eq!(started, 1);
        assert!(backend.is_running());

        backend.set_worker_limit(Some(0));
        assert!(backend.wait_stopped(Duration::from_secs(2)));
        backend.set_worker_limit(None);
    }
}

#[test]
fn test_lazy_backend_restarts_after_stop() {
    let (backend, sink) = backend_with(quick_config().with_lazy_init(true));

    backend.write("before", fields! {});
    assert!(eventually(Duration::from_secs(2), || sink.record_count() == 1));

    backend.set_worker_limit(Some(0));
    assert!(backend.wait_stopped(Duration::from_secs(2)));
    assert!(!backend.is_running());
    assert_eq!(backend.last_exit(), Some(ExitReason::LimitReached));

    backend.set_worker_limit(None);
    backend.write("again", fields! {});

    assert!(backend.is_running());
    assert!(eventually(Duration::from_secs(2), || {
        sink.records_named("again").len() == 1
    }));
}

#[test]
fn test_sink_failures_do_not_stop_worker() {
    let (backend, sink) = backend_with(quick_config());
    sink.fail_with("connection refused");

    for _ in 0..3 {
        backend.write("failing", fields! {});
    }
    // Every attempted batch is counted as a failed flush
    assert!(eventually(Duration::from_secs(2), || {
        sink.record_count() == 3
            && backend.worker_stats().failed_flushes == sink.bulk_calls().len() as u64
    }));
    assert!(backend.is_running());
    let failed = backend.worker_stats().failed_flushes;

    sink.recover();
    sink.panic_on_write(true);
    backend.write("panicking", fields! {});
    assert!(eventually(Duration::from_secs(2), || {
        backend.worker_stats().failed_flushes == failed + 1
    }));
    assert!(backend.is_running());

    sink.recover();
    sink.clear();
    backend.write("healthy", fields! {});
    assert!(eventually(Duration::from_secs(2), || {
        sink.records_named("healthy").len() == 1
    }));
    assert!(backend.worker_stats().flushes >= 1);
}

#[test]
fn test_drop_drains_pending_metrics() {
    let config = quick_config()
        .with_bulk_size(100)
        .with_bulk_timeout(Duration::from_secs(30))
        .with_shutdown_grace(Duration::from_secs(5));
    let (backend, sink) = backend_with(config);

    for i in 0..7 {
        backend.write("pending", fields! { "i" => i });
    }
    drop(backend);

    assert_eq!(sink.record_count(), 7);
    assert_eq!(sink.bulk_calls().len(), 1);
}

#[test]
fn test_concurrent_producers_account_for_every_metric() {
    let config = quick_config()
        .with_queue_maxsize(64)
        .with_shutdown_grace(Duration::from_secs(5));
    let (backend, sink) = backend_with(config);
    let backend = Arc::new(backend);

    let producers: Vec<_> = (0..4)
        .map(|t| {
            let backend = backend.clone();
            thread::spawn(move || {
                for i in 0..250 {
                    backend.write("burst", fields! { "thread" => t, "i" => i });
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let dropped = backend.dropped();
    drop(backend);

    assert_eq!(sink.record_count() + dropped, 1000);
    assert!(sink.bulk_calls().iter().all(|b| b.len() <= 5));
}

#[test]
fn test_time_threshold_flushes_partial_batch() {
    let config = quick_config().with_bulk_size(50);
    let (backend, sink) = backend_with(config);

    backend.write("lonely", fields! {});

    assert!(eventually(Duration::from_secs(2), || sink.record_count() == 1));
    assert_eq!(sink.bulk_calls().len(), 1);
    assert!(backend.is_running());
}
