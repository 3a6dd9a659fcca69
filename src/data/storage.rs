//! Record sinks and CSV file formats.
//!
//! Trace files carry a JSON metadata block, one line per `# `-prefixed row,
//! followed by a `frequency_hz,magnitude_db,phase_deg` table in acquisition
//! order. The same format is read back for background subtraction.
use crate::{
    error::{AppResult, ExpError},
    experiment::SweepRecord,
    measurement::{TemperatureSample, Trace},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Destination for sweep records.
///
/// `write_record` must have persisted the record when it returns; the sweep
/// does not advance until it has.
#[async_trait]
pub trait RecordSink: Send {
    async fn write_record(&mut self, record: &SweepRecord) -> AppResult<()>;

    /// Flush and release resources after the last record.
    async fn finish(&mut self) -> AppResult<()> {
        Ok(())
    }
}

// ============================================================================
// Trace CSV format
// ============================================================================

#[derive(Debug, Serialize)]
struct RecordMetadata<'a> {
    label: String,
    variable: String,
    setpoint: f64,
    unit: &'a str,
    timestamp: DateTime<Utc>,
    points: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct TraceRow {
    frequency_hz: f64,
    magnitude_db: f64,
    phase_deg: f64,
}

/// Write `trace` to `path`, preceded by `metadata` as commented JSON.
pub fn write_trace_csv<M: Serialize>(
    path: impl AsRef<Path>,
    trace: &Trace,
    metadata: Option<&M>,
) -> AppResult<()> {
    let path = path.as_ref();
    let mut file = File::create(path).map_err(|e| {
        ExpError::Storage(format!("failed to create {}: {}", path.display(), e))
    })?;

    if let Some(metadata) = metadata {
        let json_string = serde_json::to_string_pretty(metadata)?;
        for line in json_string.lines() {
            file.write_all(b"# ")
                .and_then(|_| file.write_all(line.as_bytes()))
                .and_then(|_| file.write_all(b"\n"))?;
        }
    }

    let mut writer = csv::Writer::from_writer(file);
    for ((&frequency_hz, &magnitude_db), &phase_deg) in trace
        .frequencies()
        .iter()
        .zip(trace.magnitude())
        .zip(trace.phase())
    {
        writer.serialize(TraceRow {
            frequency_hz,
            magnitude_db,
            phase_deg,
        })?;
    }
    // on disk before the caller moves on to the next step
    let file = writer.into_inner().map_err(|e| {
        ExpError::Storage(format!("failed to flush {}: {}", path.display(), e.error()))
    })?;
    file.sync_all()?;
    Ok(())
}

/// Read a trace written by [`write_trace_csv`].
pub fn read_trace_csv(path: impl AsRef<Path>) -> AppResult<Trace> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| ExpError::Storage(format!("failed to open {}: {}", path.display(), e)))?;

    let mut frequencies = Vec::new();
    let mut magnitude = Vec::new();
    let mut phase = Vec::new();
    for row in reader.deserialize::<TraceRow>() {
        let row = row?;
        frequencies.push(row.frequency_hz);
        magnitude.push(row.magnitude_db);
        phase.push(row.phase_deg);
    }
    Trace::new(frequencies, magnitude, phase)
}

// ============================================================================
// CSV record writer
// ============================================================================

/// One CSV file per sweep step, named by the set-point label.
pub struct CsvRecordWriter {
    output_dir: PathBuf,
    written: Vec<PathBuf>,
}

impl CsvRecordWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir).map_err(|e| {
            ExpError::Storage(format!(
                "failed to create storage directory {}: {}",
                output_dir.display(),
                e
            ))
        })?;
        info!("CSV record writer initialized at '{}'.", output_dir.display());
        Ok(Self {
            output_dir,
            written: Vec::new(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Files written so far, in order.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// `<label>.csv`, or `<label>_<n>.csv` if that name is taken.
    fn path_for(&self, label: &str) -> PathBuf {
        let mut path = self.output_dir.join(format!("{}.csv", label));
        let mut n = 2;
        while path.exists() {
            path = self.output_dir.join(format!("{}_{}.csv", label, n));
            n += 1;
        }
        path
    }
}

#[async_trait]
impl RecordSink for CsvRecordWriter {
    async fn write_record(&mut self, record: &SweepRecord) -> AppResult<()> {
        let path = self.path_for(&record.label());
        let metadata = RecordMetadata {
            label: record.label(),
            variable: record.variable().to_string(),
            setpoint: record.setpoint(),
            unit: record.variable().unit(),
            timestamp: record.timestamp(),
            points: record.trace().len(),
        };
        write_trace_csv(&path, record.trace(), Some(&metadata))?;
        debug!("wrote {}", path.display());
        self.written.push(path);
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        info!(
            "CSV record writer finished: {} files in '{}'.",
            self.written.len(),
            self.output_dir.display()
        );
        Ok(())
    }
}

// ============================================================================
// Memory sink
// ============================================================================

/// Keeps records in memory; can be told to fail, for tests of storage faults.
#[derive(Default)]
pub struct MemorySink {
    records: Vec<SweepRecord>,
    fail_after: Option<usize>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `records` writes, then fail every further one.
    pub fn failing_after(records: usize) -> Self {
        Self {
            fail_after: Some(records),
            ..Self::default()
        }
    }

    pub fn records(&self) -> &[SweepRecord] {
        &self.records
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write_record(&mut self, record: &SweepRecord) -> AppResult<()> {
        if self.fail_after.is_some_and(|limit| self.records.len() >= limit) {
            return Err(ExpError::Storage(format!(
                "memory sink refused record {}",
                record.label()
            )));
        }
        self.records.push(record.clone());
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.finished = true;
        Ok(())
    }
}

// ============================================================================
// Temperature log
// ============================================================================

#[derive(Debug, Serialize)]
struct TemperatureRow {
    time_s: f64,
    posix_s: f64,
    resistance_ohm: f64,
    temperature_k: f64,
}

/// Append-only temperature log, flushed after every sample.
pub struct TemperatureLogWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    origin: Option<DateTime<Utc>>,
}

impl TemperatureLogWriter {
    pub fn create(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = csv::Writer::from_path(&path)?;
        info!("Temperature log initialized at '{}'.", path.display());
        Ok(Self {
            path,
            writer,
            origin: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one sample; elapsed time counts from the first sample.
    pub fn append(&mut self, sample: &TemperatureSample) -> AppResult<()> {
        let origin = *self.origin.get_or_insert(sample.timestamp);
        let elapsed = sample.timestamp - origin;
        let row = TemperatureRow {
            time_s: elapsed.num_milliseconds() as f64 / 1000.0,
            posix_s: sample.timestamp.timestamp_millis() as f64 / 1000.0,
            resistance_ohm: sample.resistance_ohm,
            temperature_k: sample.temperature_k,
        };
        self.writer.serialize(row)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}
