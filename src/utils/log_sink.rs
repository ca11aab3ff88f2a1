//! log_sink.rs
//! Append-only log sinks for routed telemetry.
//!
//! A sink takes `(timestamp, fields...)` rows and flushes after every write.
//! Sinks are opened per (instance, mode) by a `SinkFactory` when the host sees an
//! activation confirmed, and closed before the next one is opened.

use std::{
    collections::HashMap,
    fs::{File, create_dir_all},
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use csv::Writer;
use parking_lot::Mutex;

use crate::device::params::ExperimentMode;
use crate::error::{PlatformError, Result};
use crate::telemetry::TelemetrySample;

pub trait LogSink: Send {
    fn label(&self) -> &str;
    /// Append one row and flush it.
    fn write_row(&mut self, timestamp: f64, fields: &[String]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

pub trait SinkFactory: Send + Sync {
    fn open(&self, instance: &str, mode: ExperimentMode) -> Result<Box<dyn LogSink>>;
}

/// Seconds since the Unix epoch.
pub fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ============================================================================
// CSV files
// ============================================================================

pub struct CsvLogSink {
    label: String,
    path: PathBuf,
    writer: Option<Writer<File>>,
}

impl CsvLogSink {
    pub fn create(path: &Path, mode: ExperimentMode) -> Result<Self> {
        if let Some(dir) = path.parent() {
            create_dir_all(dir)?;
        }
        let mut writer = Writer::from_path(path).map_err(csv_err)?;
        let mut header = vec!["timestamp"];
        header.extend_from_slice(TelemetrySample::columns(mode));
        writer.write_record(&header).map_err(csv_err)?;
        writer.flush()?;
        Ok(Self {
            label: path.display().to_string(),
            path: path.to_path_buf(),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn csv_err(e: csv::Error) -> PlatformError {
    match e.into_kind() {
        csv::ErrorKind::Io(io) => PlatformError::Io(io),
        other => PlatformError::Config(format!("csv: {other:?}")),
    }
}

impl LogSink for CsvLogSink {
    fn label(&self) -> &str {
        &self.label
    }

    fn write_row(&mut self, timestamp: f64, fields: &[String]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PlatformError::transport(format!("{} already closed", self.label)))?;
        let ts = format!("{timestamp:.6}");
        writer
            .write_record(std::iter::once(ts.as_str()).chain(fields.iter().map(String::as_str)))
            .map_err(csv_err)?;
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// `<dir>/<instance>_<mode>_<unix seconds>.csv`
pub struct CsvSinkFactory {
    pub dir: PathBuf,
}

impl SinkFactory for CsvSinkFactory {
    fn open(&self, instance: &str, mode: ExperimentMode) -> Result<Box<dyn LogSink>> {
        let stamp = wall_clock() as u64;
        let path = self
            .dir
            .join(format!("{}_{}_{}.csv", instance, mode.segment(), stamp));
        Ok(Box::new(CsvLogSink::create(&path, mode)?))
    }
}

// ============================================================================
// In-memory sinks (tests, demo)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRow {
    pub timestamp: f64,
    pub fields: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    rows: Vec<LoggedRow>,
    closed: bool,
    writes_after_close: u64,
}

/// Shared view of what a `MemoryLogSink` received.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Mutex<MemoryLogInner>>,
}

impl MemoryLog {
    pub fn rows(&self) -> Vec<LoggedRow> {
        self.inner.lock().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn writes_after_close(&self) -> u64 {
        self.inner.lock().writes_after_close
    }
}

pub struct MemoryLogSink {
    label: String,
    log: MemoryLog,
}

impl MemoryLogSink {
    pub fn new(label: &str) -> (Self, MemoryLog) {
        let log = MemoryLog::default();
        (
            Self {
                label: label.to_string(),
                log: log.clone(),
            },
            log,
        )
    }
}

impl LogSink for MemoryLogSink {
    fn label(&self) -> &str {
        &self.label
    }

    fn write_row(&mut self, timestamp: f64, fields: &[String]) -> Result<()> {
        let mut inner = self.log.inner.lock();
        if inner.closed {
            inner.writes_after_close += 1;
            return Err(PlatformError::transport(format!("{} already closed", self.label)));
        }
        inner.rows.push(LoggedRow {
            timestamp,
            fields: fields.to_vec(),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.log.inner.lock().closed = true;
        Ok(())
    }
}

/// Opens one `MemoryLogSink` per activation and keeps every log for inspection.
#[derive(Default, Clone)]
pub struct MemorySinkFactory {
    logs: Arc<Mutex<HashMap<String, Vec<MemoryLog>>>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every log opened for `instance`, oldest first.
    pub fn logs_for(&self, instance: &str) -> Vec<MemoryLog> {
        self.logs.lock().get(instance).cloned().unwrap_or_default()
    }

    pub fn rows_for(&self, instance: &str) -> usize {
        self.logs_for(instance).iter().map(MemoryLog::len).sum()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, instance: &str, mode: ExperimentMode) -> Result<Box<dyn LogSink>> {
        let (sink, log) = MemoryLogSink::new(&format!("{}/{}", instance, mode.segment()));
        self.logs
            .lock()
            .entry(instance.to_string())
            .or_default()
            .push(log);
        Ok(Box::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_sink_writes_header_and_flushes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_pid.csv");
        let mut sink = CsvLogSink::create(&path, ExperimentMode::Deadband).unwrap();
        sink.write_row(1.5, &["0.1".into(), "10".into(), "20.0".into(), "20.0".into(), "0".into()])
            .unwrap();

        // flushed without closing
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,elapsed_time,drive,position,initial_position,motion_detected");
        assert_eq!(lines[1], "1.500000,0.1,10,20.0,20.0,0");

        sink.close().unwrap();
        assert!(sink.write_row(2.0, &[]).is_err());
    }

    #[test]
    fn memory_sink_refuses_writes_after_close() {
        let (mut sink, log) = MemoryLogSink::new("t");
        sink.write_row(0.0, &["1".into()]).unwrap();
        sink.close().unwrap();
        assert!(sink.write_row(0.0, &["2".into()]).is_err());
        assert_eq!(log.len(), 1);
        assert!(log.is_closed());
        assert_eq!(log.writes_after_close(), 1);
    }

    #[test]
    fn factory_keeps_one_log_per_activation() {
        let factory = MemorySinkFactory::new();
        factory.open("a", ExperimentMode::Pid).unwrap();
        factory.open("a", ExperimentMode::Step).unwrap();
        factory.open("b", ExperimentMode::Pid).unwrap();
        assert_eq!(factory.logs_for("a").len(), 2);
        assert_eq!(factory.logs_for("b").len(), 1);
        assert!(factory.logs_for("c").is_empty());
    }
}
