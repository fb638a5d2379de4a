//! spotter-runner: the run controller and its wiring
//!
//! Acquires frames (camera capture command or a static image folder), runs
//! them through the software or hybrid pipeline with every stage measured
//! on the timed event log, and hands results to the publisher.

pub mod acquisition;
pub mod cli;
pub mod controller;
pub mod logging;
pub mod setup;
pub mod stages;

pub use acquisition::{CommandCaptureSource, Frame, FrameSource, StaticFileSource};
pub use cli::Cli;
pub use controller::{ExitReason, RunController};
pub use stages::{timed, DetectionStages, HybridStages, SoftwareStages, StageError, StageLabels};
