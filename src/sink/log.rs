use tracing::Level;

use super::{MetricSink, SinkError};
use crate::record::{Fields, MetricRecord};

/// Sink that emits each metric as a structured `tracing` event.
///
/// Useful during development and as a fallback when no store is configured.
#[derive(Debug, Clone)]
pub struct LogSink {
    level: Level,
}

impl LogSink {
    pub fn new(level: Level) -> Self {
        LogSink { level }
    }

    fn emit(&self, record: &MetricRecord) {
        let fields = record.to_json();
        match self.level {
            Level::ERROR => tracing::error!(metric = record.name(), %fields, "metric"),
            Level::WARN => tracing::warn!(metric = record.name(), %fields, "metric"),
            Level::INFO => tracing::info!(metric = record.name(), %fields, "metric"),
            Level::DEBUG => tracing::debug!(metric = record.name(), %fields, "metric"),
            _ => tracing::trace!(metric = record.name(), %fields, "metric"),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        LogSink::new(Level::INFO)
    }
}

impl MetricSink for LogSink {
    fn write(&self, name: &str, fields: Fields) -> Result<(), SinkError> {
        self.emit(&MetricRecord::new(name, fields));
        Ok(())
    }

    fn bulk_write(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        for record in records {
            self.emit(record);
        }
        Ok(())
    }
}
