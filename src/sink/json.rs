//! JSON lines sink
//!
//! Writes one flat JSON object per record per line, timestamps as ISO-8601
//! strings. Works on any `Write`, so it covers files, sockets and pipes that
//! feed a log shipper.

use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use super::{MetricSink, SinkError};
use crate::record::{Fields, MetricRecord};

pub struct JsonLinesSink<W: Write + Send + 'static> {
    target: String,
    writer: Mutex<Option<W>>,
}

impl<W: Write + Send + 'static> JsonLinesSink<W> {
    /// Wrap an already open writer
    pub fn new(writer: W, target: impl Into<String>) -> Self {
        JsonLinesSink {
            target: target.into(),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Whether the sink has a usable writer
    pub fn is_degraded(&self) -> bool {
        self.writer.lock().is_none()
    }

    /// Consume the sink and return the writer, if any
    pub fn into_inner(self) -> Option<W> {
        self.writer.into_inner()
    }

    fn write_lines(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        let mut guard = self.writer.lock();
        let writer = match guard.as_mut() {
            Some(w) => w,
            None => {
                warn!(
                    target = %self.target,
                    count = records.len(),
                    "JSON lines sink degraded, discarding metrics"
                );
                return Ok(());
            }
        };

        // Encode the whole batch first so a bad record writes nothing
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, &record.to_json())?;
            buf.push(b'\n');
        }

        if let Err(e) = writer.write_all(&buf).and_then(|()| writer.flush()) {
            // The writer may hold a partial line now; stop using it
            error!(
                target = %self.target,
                error = %e,
                "JSON lines sink write failed, discarding further metrics"
            );
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }
}

impl JsonLinesSink<BufWriter<File>> {
    /// Open `path` for appending.
    ///
    /// Failure to open the file is logged and yields a degraded sink that
    /// discards metrics, so a bad path never aborts application startup.
    pub fn create(path: impl AsRef<Path>) -> Self {
        let path: PathBuf = path.as_ref().to_path_buf();
        let target = path.display().to_string();
        let writer = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                error!(path = %target, "client setup error {}", e);
                None
            }
        };
        JsonLinesSink {
            target,
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send + 'static> fmt::Debug for JsonLinesSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesSink")
            .field("target", &self.target)
            .finish()
    }
}

impl<W: Write + Send + 'static> MetricSink for JsonLinesSink<W> {
    fn write(&self, name: &str, fields: Fields) -> Result<(), SinkError> {
        self.write_lines(&[MetricRecord::new(name, fields)])
    }

    fn bulk_write(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        self.write_lines(records)
    }
}
