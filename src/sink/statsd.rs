//! DogStatsD Sink
//!
//! Non-blocking UDP sink for a Datadog agent. Each record becomes one timing
//! sample named `{prefix}.{metric name}`; string fields become `key:value`
//! tags. Gracefully degrades if the client cannot be created.

use dogstatsd::{Client, Options};
use std::fmt;

use super::{MetricSink, SinkError};
use crate::record::{FieldValue, Fields, MetricRecord, TIMESTAMP_FIELD};

pub struct DogStatsdSink {
    client: Option<Client>,
    addr: String,
    prefix: String,
    duration_field: String,
    global_tags: Vec<String>,
}

impl DogStatsdSink {
    /// Create a sink sending to `addr` (e.g. `127.0.0.1:8125`)
    pub fn new(addr: &str, prefix: &str, duration_field: &str, global_tags: Vec<String>) -> Self {
        let client = match Client::new(Options {
            to_addr: addr.to_string(),
            ..Default::default()
        }) {
            Ok(c) => {
                tracing::info!("DogStatsD client connected to {}", addr);
                Some(c)
            }
            Err(e) => {
                tracing::warn!("Failed to create DogStatsD client: {}. Metrics disabled.", e);
                None
            }
        };

        DogStatsdSink {
            client,
            addr: addr.to_string(),
            prefix: prefix.to_string(),
            duration_field: duration_field.to_string(),
            global_tags,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.client.is_none()
    }

    fn send(&self, record: &MetricRecord) -> Result<(), SinkError> {
        let client = match self.client {
            Some(ref c) => c,
            None => return Ok(()),
        };

        let duration_ms = record
            .get(&self.duration_field)
            .and_then(FieldValue::as_f64)
            .unwrap_or(0.0);
        let metric_name = if self.prefix.is_empty() {
            record.name().to_string()
        } else {
            format!("{}.{}", self.prefix, record.name())
        };

        client
            .timing(&metric_name, duration_ms as i64, self.tags_for(record))
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }

    fn tags_for(&self, record: &MetricRecord) -> Vec<String> {
        let record_tags = record
            .fields()
            .iter()
            .filter(|(key, _)| key.as_str() != TIMESTAMP_FIELD)
            .filter_map(|(key, value)| value.as_str().map(|v| format!("{}:{}", key, v)));

        self.global_tags.iter().cloned().chain(record_tags).collect()
    }
}

impl fmt::Debug for DogStatsdSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DogStatsdSink")
            .field("addr", &self.addr)
            .field("prefix", &self.prefix)
            .field("degraded", &self.client.is_none())
            .finish()
    }
}

impl MetricSink for DogStatsdSink {
    fn write(&self, name: &str, fields: Fields) -> Result<(), SinkError> {
        self.send(&MetricRecord::new(name, fields))
    }

    fn bulk_write(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        send_all(records, |record| self.send(record))
    }
}

/// Attempt every record, then report the first failure
fn send_all<F>(records: &[MetricRecord], mut send: F) -> Result<(), SinkError>
where
    F: FnMut(&MetricRecord) -> Result<(), SinkError>,
{
    let mut first_err = None;
    for record in records {
        if let Err(e) = send(record) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}
