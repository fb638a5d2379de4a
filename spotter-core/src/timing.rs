//! Timed event log
//!
//! Append-only instrumentation for the pipeline stages. `trigger()` records a
//! timestamp in memory, `end()` records the closing timestamp plus the
//! duration between the two and hands the three rows to the durable sink
//! before evicting them, so at most a handful of rows are ever buffered.
//!
//! Rows are grouped by a run index that only moves forward through
//! [`TimingLog::next_index`], once per completed loop iteration.

use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Header row of the csv sink
pub const CSV_HEADER: &str = "index,type,time,text";

/// Rows emitted by one completed measurement: start, end, duration
const ROWS_PER_MEASUREMENT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    Timestamp = 0,
    Duration = 1,
}

impl EventKind {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    fn describe(&self) -> &'static str {
        match self {
            EventKind::Timestamp => "Timestamp",
            EventKind::Duration => "Duration",
        }
    }
}

/// Point in time for timestamps, elapsed time for durations
#[derive(Debug, Clone, PartialEq)]
pub enum Moment {
    Instant(DateTime<Local>),
    Elapsed(chrono::Duration),
    /// Duration of a stage that failed before its `end()`
    Aborted,
}

impl fmt::Display for Moment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Moment::Instant(at) => write!(f, "{}", at.format("%Y-%m-%d %H:%M:%S%.6f")),
            Moment::Elapsed(elapsed) => {
                let seconds = match elapsed.num_microseconds() {
                    Some(us) => us as f64 / 1_000_000.0,
                    None => elapsed.num_milliseconds() as f64 / 1_000.0,
                };
                write!(f, "{:.6}", seconds)
            }
            Moment::Aborted => write!(f, "-1"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    pub run_index: u64,
    pub kind: EventKind,
    pub moment: Moment,
    pub label: Option<String>,
}

impl TimedEvent {
    /// `index,type,time,text` row without line terminator
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{}",
            self.run_index,
            self.kind.code(),
            self.moment,
            self.label.as_deref().map(csv_field).unwrap_or_default()
        )
    }

    fn instant(&self) -> Option<DateTime<Local>> {
        match (&self.kind, &self.moment) {
            (EventKind::Timestamp, Moment::Instant(at)) => Some(*at),
            _ => None,
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Durable destination for finished measurements
pub trait TimingSink: Send {
    fn append(&mut self, events: &[TimedEvent]) -> Result<()>;
}

/// Csv file sink. A new file per process start named
/// `<YYYYMMDDHHMM>-<host>-<title>.csv`.
pub struct CsvFileSink {
    path: PathBuf,
    file: File,
}

impl CsvFileSink {
    pub fn create(dir: impl AsRef<Path>, title: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let title = title.strip_suffix(".csv").unwrap_or(title);
        let stem = format!(
            "{}-{}-{}",
            Local::now().format("%Y%m%d%H%M"),
            crate::host_name(),
            title
        );

        let mut path = dir.join(format!("{}.csv", stem));
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // another process with the same title started this minute
                path = dir.join(format!("{}-{}.csv", stem, std::process::id()));
                OpenOptions::new().write(true).create_new(true).open(&path)?
            }
            Err(e) => return Err(e.into()),
        };

        let mut sink = Self { path, file };
        writeln!(sink.file, "{}", CSV_HEADER)?;
        sink.file.flush()?;
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TimingSink for CsvFileSink {
    fn append(&mut self, events: &[TimedEvent]) -> Result<()> {
        let mut rows = String::new();
        for event in events {
            rows.push_str(&event.to_csv_row());
            rows.push('\n');
        }
        self.file.write_all(rows.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

/// In-memory sink; clones share the collected events
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TimedEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<TimedEvent> {
        self.events.lock().clone()
    }
}

impl TimingSink for MemorySink {
    fn append(&mut self, events: &[TimedEvent]) -> Result<()> {
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

pub struct TimingLog {
    title: String,
    report: bool,
    run_index: u64,
    events: Vec<TimedEvent>,
    sink: Option<Box<dyn TimingSink>>,
}

impl TimingLog {
    pub fn new(title: impl Into<String>, report: bool, sink: Option<Box<dyn TimingSink>>) -> Self {
        Self {
            title: title.into(),
            report,
            run_index: 0,
            events: Vec::new(),
            sink,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn run_index(&self) -> u64 {
        self.run_index
    }

    /// Rows still buffered (not yet handed to the sink)
    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    /// Record the current instant. Memory only.
    pub fn trigger(&mut self, label: Option<&str>) {
        self.events.push(TimedEvent {
            run_index: self.run_index,
            kind: EventKind::Timestamp,
            moment: Moment::Instant(Local::now()),
            label: label.map(str::to_string),
        });
    }

    /// Append the difference of the two most recent timestamps as a duration.
    pub fn calc(&mut self, label: Option<&str>) -> Result<chrono::Duration> {
        let n = self.events.len();
        let (start, end) = match (n.checked_sub(2), n.checked_sub(1)) {
            (Some(a), Some(b)) => (&self.events[a], &self.events[b]),
            _ => {
                return Err(Error::Timing(format!(
                    "calc() needs two timestamps, buffer holds {}",
                    n
                )))
            }
        };

        let elapsed = match (start.instant(), end.instant()) {
            (Some(s), Some(e)) if start.run_index == self.run_index && end.run_index == self.run_index => {
                e.signed_duration_since(s)
            }
            _ => {
                return Err(Error::Timing(
                    "calc() needs two timestamps of the current run index".to_string(),
                ))
            }
        };

        self.events.push(TimedEvent {
            run_index: self.run_index,
            kind: EventKind::Duration,
            moment: Moment::Elapsed(elapsed),
            label: label.map(str::to_string),
        });
        Ok(elapsed)
    }

    /// Close the measurement opened by the last `trigger()`.
    ///
    /// The closing timestamp is labelled `start_label`, else `duration_label`,
    /// else the title; the duration is labelled `duration_label`, else
    /// `start_label`, else the title. Fails without recording anything when
    /// no trigger is open in the current run index.
    pub fn end(
        &mut self,
        start_label: Option<&str>,
        duration_label: Option<&str>,
    ) -> Result<chrono::Duration> {
        if !self.has_open_trigger() {
            return Err(Error::Timing(format!(
                "end() without a preceding trigger() in run {}",
                self.run_index
            )));
        }

        let title = self.title.clone();
        self.trigger(Some(start_label.or(duration_label).unwrap_or(&title)));
        let elapsed = self.calc(Some(duration_label.or(start_label).unwrap_or(&title)))?;
        self.finish_measurement();
        Ok(elapsed)
    }

    /// Close an open trigger of a failed stage with the aborted sentinel.
    ///
    /// Returns false when nothing was open.
    pub fn abort(&mut self, label: Option<&str>) -> bool {
        if !self.has_open_trigger() {
            return false;
        }

        let title = self.title.clone();
        let label = label.unwrap_or(&title).to_string();
        self.trigger(Some(&label));
        self.events.push(TimedEvent {
            run_index: self.run_index,
            kind: EventKind::Duration,
            moment: Moment::Aborted,
            label: Some(label),
        });
        self.finish_measurement();
        true
    }

    /// Start the next measurement series.
    pub fn next_index(&mut self) {
        let current = self.run_index;
        let stale = self.events.iter().filter(|e| e.run_index == current).count();
        if stale > 0 {
            warn!(
                run_index = current,
                stale, "discarding unterminated timing rows"
            );
            self.events.retain(|e| e.run_index != current);
        }
        self.run_index += 1;
    }

    pub fn has_open_trigger(&self) -> bool {
        matches!(
            self.events.last(),
            Some(TimedEvent { kind: EventKind::Timestamp, run_index, .. }) if *run_index == self.run_index
        )
    }

    /// Report line for the most recent row
    pub fn reporting(&self) -> Option<String> {
        self.events.last().map(|event| {
            let value = match &event.moment {
                Moment::Elapsed(_) => format!("{}s", event.moment),
                other => other.to_string(),
            };
            match &event.label {
                Some(label) => format!("{} of {} is {}", event.kind.describe(), label, value),
                None => format!("{} is {}", event.kind.describe(), value),
            }
        })
    }

    fn finish_measurement(&mut self) {
        if self.report {
            if let Some(line) = self.reporting() {
                info!("{}", line);
            }
        }

        let start = self.events.len().saturating_sub(ROWS_PER_MEASUREMENT);
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.append(&self.events[start..]) {
                error!("Failed to write timing rows for '{}': {}", self.title, e);
            }
        }
        self.events.truncate(start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_log() -> (TimingLog, MemorySink) {
        let sink = MemorySink::new();
        let log = TimingLog::new("test", false, Some(Box::new(sink.clone())));
        (log, sink)
    }

    #[test]
    fn test_trigger_end_emits_three_rows() {
        let (mut log, sink) = memory_log();
        log.trigger(Some("load image begin"));
        let elapsed = log.end(Some("load image end"), Some("Image Loading")).unwrap();

        let rows = sink.snapshot();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].kind, EventKind::Timestamp);
        assert_eq!(rows[1].kind, EventKind::Timestamp);
        assert_eq!(rows[2].kind, EventKind::Duration);
        assert_eq!(rows[1].label.as_deref(), Some("load image end"));
        assert_eq!(rows[2].label.as_deref(), Some("Image Loading"));
        assert_eq!(rows[2].moment, Moment::Elapsed(elapsed));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_end_label_fallbacks() {
        let (mut log, sink) = memory_log();
        log.trigger(None);
        log.end(None, Some("only duration")).unwrap();
        log.trigger(None);
        log.end(Some("only start"), None).unwrap();
        log.trigger(None);
        log.end(None, None).unwrap();

        let labels: Vec<_> = sink.snapshot().into_iter().map(|e| e.label).collect();
        assert_eq!(labels[1].as_deref(), Some("only duration"));
        assert_eq!(labels[2].as_deref(), Some("only duration"));
        assert_eq!(labels[4].as_deref(), Some("only start"));
        assert_eq!(labels[5].as_deref(), Some("only start"));
        assert_eq!(labels[7].as_deref(), Some("test"));
        assert_eq!(labels[8].as_deref(), Some("test"));
    }

    #[test]
    fn test_end_without_trigger_fails() {
        let (mut log, sink) = memory_log();
        assert!(matches!(log.end(None, None), Err(Error::Timing(_))));
        assert!(log.events().is_empty());
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn test_end_after_index_change_fails() {
        let (mut log, _sink) = memory_log();
        log.trigger(Some("begin"));
        log.next_index();
        assert!(log.end(None, None).is_err());
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_calc_needs_two_timestamps() {
        let (mut log, _sink) = memory_log();
        log.trigger(None);
        assert!(log.calc(None).is_err());
        log.trigger(None);
        assert!(log.calc(Some("manual")).is_ok());
        assert_eq!(log.events().len(), 3);
    }

    #[test]
    fn test_abort_closes_open_trigger() {
        let (mut log, sink) = memory_log();
        assert!(!log.abort(Some("nothing open")));

        log.trigger(Some("accelerator begin"));
        assert!(log.abort(Some("Accelerator Layers")));
        let rows = sink.snapshot();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].moment, Moment::Aborted);
        assert_eq!(rows[2].to_csv_row(), "0,1,-1,Accelerator Layers");
        assert!(!log.has_open_trigger());
    }

    #[test]
    fn test_next_index_monotonic() {
        let (mut log, sink) = memory_log();
        for expected in 0..5u64 {
            assert_eq!(log.run_index(), expected);
            log.trigger(None);
            log.end(None, None).unwrap();
            log.next_index();
        }
        let indices: Vec<u64> = sink.snapshot().iter().map(|e| e.run_index).collect();
        assert!(indices.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_without_sink_buffer_stays_bounded() {
        let mut log = TimingLog::new("nosink", true, None);
        for _ in 0..100 {
            log.trigger(None);
            log.end(None, None).unwrap();
        }
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_reporting_format() {
        let mut log = TimingLog::new("report", false, None);
        log.trigger(Some("begin"));
        assert!(log.reporting().unwrap().starts_with("Timestamp of begin is "));
        log.trigger(Some("end"));
        log.calc(Some("Stage")).unwrap();
        let line = log.reporting().unwrap();
        assert!(line.starts_with("Duration of Stage is "));
        assert!(line.ends_with('s'));
    }

    #[test]
    fn test_csv_field_quoting() {
        let event = TimedEvent {
            run_index: 3,
            kind: EventKind::Duration,
            moment: Moment::Elapsed(chrono::Duration::milliseconds(1500)),
            label: Some("a, \"b\"".to_string()),
        };
        assert_eq!(event.to_csv_row(), "3,1,1.500000,\"a, \"\"b\"\"\"");
    }

    #[test]
    fn test_csv_file_sink_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvFileSink::create(dir.path(), "sw-test.csv").unwrap();
        let path = sink.path().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("-sw-test.csv"));
        assert!(!name.ends_with(".csv.csv"));

        let mut log = TimingLog::new("sw-test", false, Some(Box::new(sink)));
        log.trigger(Some("begin"));
        log.end(Some("end"), Some("Stage")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("0,0,"));
        assert!(lines[3].starts_with("0,1,"));
        assert!(lines[3].ends_with(",Stage"));
    }

    #[test]
    fn test_csv_file_sink_avoids_collision() {
        let dir = tempfile::tempdir().unwrap();
        let first = CsvFileSink::create(dir.path(), "same").unwrap();
        let second = CsvFileSink::create(dir.path(), "same").unwrap();
        assert_ne!(first.path(), second.path());
    }
}
