//! Threaded Backend Demo
//!
//! Times a burst of synthetic calls through the configured pipeline and
//! reports what the backends saw.
//!
//! Usage: `time-execution-demo [config.toml] [--calls N]`
//!
//! Without a config file, metrics go through a threaded in-memory sink and a
//! summary is printed at the end.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use time_execution::observability::init_tracing;
use time_execution::sink::{MemorySink, SinkRegistry};
use time_execution::{
    fields, fqn, hook, try_time_execution, FieldValue, PipelineConfig, SettingsHandle, SharedSink, SinkSource,
    ThreadedBackend,
};

const DEFAULT_CALLS: usize = 200;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).filter(|a| !a.starts_with("--"));
    let calls = args
        .iter()
        .position(|a| a == "--calls")
        .and_then(|i| args.get(i + 1))
        .and_then(|n| n.parse().ok())
        .unwrap_or(DEFAULT_CALLS);

    let config = match config_path {
        Some(path) => PipelineConfig::load(path)?.with_env()?,
        None => PipelineConfig::from_env()?,
    };
    init_tracing(&config.log).map_err(|e| e.to_string())?;

    println!("Threaded Metric Pipeline Demo");
    println!("=============================");
    println!();
    println!("Configuration:");
    println!("  Calls: {}", calls);
    println!("  Queue capacity: {}", config.threaded.queue_maxsize);
    println!("  Bulk size: {}", config.threaded.bulk_size);
    println!("  Bulk timeout: {:?}", config.threaded.bulk_timeout);
    println!();

    let registry = SinkRegistry::builtin();
    let mut settings = config.build_settings(&registry)?;

    // Fall back to an in-memory sink so the demo always has something to report
    let memory = Arc::new(MemorySink::new());
    let fallback = if settings.backends.is_empty() {
        let backend = ThreadedBackend::with_registry(
            SinkSource::Instance(memory.clone()),
            config.threaded.clone(),
            &registry,
        )?;
        let backend = Arc::new(backend);
        settings.backends.push(backend.clone() as SharedSink);
        Some(backend)
    } else {
        None
    };

    let settings = settings.with_hook(hook(|ctx| {
        Some(fields! { "failed" => ctx.error.is_some() })
    }));
    let handle = SettingsHandle::new(settings);

    for i in 0..calls {
        let _ = try_time_execution(&handle, &fqn!("synthetic_call"), || {
            thread::sleep(Duration::from_micros(200));
            if i % 17 == 0 {
                Err(format!("call {} failed", i))
            } else {
                Ok(i)
            }
        });
    }

    if let Some(backend) = &fallback {
        // Give the worker one bulk timeout plus a poll to catch up
        thread::sleep(config.threaded.bulk_timeout + config.threaded.queue_timeout);
        let stats = backend.worker_stats();

        println!("Results:");
        println!("  Delivered: {}", memory.record_count());
        println!("  Dropped (queue full): {}", backend.dropped());
        println!("  Batches flushed: {}", stats.flushes);
        println!("  Failed flushes: {}", stats.failed_flushes);
        println!(
            "  Failed calls recorded: {}",
            memory
                .records()
                .iter()
                .filter(|r| r.get("failed") == Some(&FieldValue::Bool(true)))
                .count()
        );
    }

    // Dropping the settings releases the backends; each waits for its worker to drain.
    drop(handle);
    drop(fallback);
    println!();
    println!("Done.");
    Ok(())
}
