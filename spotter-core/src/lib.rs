//! spotter-core: shared building blocks for the spotter detection service
//!
//! Holds the pieces every other crate agrees on: the error taxonomy, the
//! resolved configuration, the timed event log used to instrument each
//! pipeline stage, the detection result handed to the publisher and the
//! run/stop flag shared with the message bus thread.

pub mod config;
pub mod detection;
pub mod error;
pub mod run_state;
pub mod timing;

pub use config::{ConfigError, PipelineMode, SpotterConfig};
pub use detection::{BoxXywh, DetectionResult, ImageSource, ResultPublisher};
pub use error::{Error, Result};
pub use run_state::RunState;
pub use timing::{CsvFileSink, EventKind, MemorySink, Moment, TimedEvent, TimingLog, TimingSink};

/// Host name used in generated file names (time logs, raw frames, log files).
pub fn host_name() -> String {
    gethostname::gethostname()
        .to_string_lossy()
        .replace(|c: char| c.is_whitespace() || c == '/' || c == '\\', "_")
}
