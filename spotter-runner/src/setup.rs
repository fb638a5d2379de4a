//! Construction of the controller's collaborators from configuration

use crate::acquisition::{CommandCaptureSource, FrameSource, StaticFileSource};
use crate::stages::{self, DetectionStages, HybridStages, SoftwareStages};
use spotter_core::{CsvFileSink, PipelineMode, Result, SpotterConfig, TimingLog, TimingSink};
use spotter_eye::{HybridPipeline, SoftwarePipeline, VisionError};
use tracing::info;

/// Scratch directory for frames that are not kept
pub const TRANSIENT_FRAME_DIR: &str = "spotter-frames";

pub fn build_timing_log(config: &SpotterConfig) -> Result<TimingLog> {
    let title = config.timing_title();
    let sink: Option<Box<dyn TimingSink>> = if config.timing_file_write() {
        let sink = CsvFileSink::create(&config.paths.timelog_dir, &title)?;
        info!("Writing time log to {:?}", sink.path());
        Some(Box::new(sink))
    } else {
        None
    };
    Ok(TimingLog::new(title, config.timing.report, sink))
}

/// Build the pipeline selected at start. In hybrid mode this claims the
/// accelerator.
pub fn build_stages(config: &SpotterConfig) -> std::result::Result<Box<dyn DetectionStages>, VisionError> {
    match config.app.pipeline {
        PipelineMode::Software => {
            let pipeline = SoftwarePipeline::from_config(&config.software)?;
            let save_dir = config
                .app
                .save_images
                .then(|| config.paths.detection_image_dir.clone());
            Ok(Box::new(SoftwareStages::new(pipeline, save_dir)))
        }
        PipelineMode::Hybrid => {
            let pipeline = HybridPipeline::from_config(&config.hybrid, config.paths.detection_image_dir.clone())?;
            Ok(Box::new(HybridStages::new(pipeline)))
        }
    }
}

/// [`build_stages`] bracketed as the setup measurement
pub fn setup_stages(config: &SpotterConfig, log: &mut TimingLog) -> Result<Box<dyn DetectionStages>> {
    stages::timed(log, &stages::SETUP, || build_stages(config)).map_err(|e| e.source)
}

pub fn build_source(config: &SpotterConfig) -> Result<Box<dyn FrameSource>> {
    if config.app.static_images {
        return Ok(Box::new(StaticFileSource::from_dir(&config.paths.input_image_dir)?));
    }

    let keep = config.app.save_images;
    let dir = if keep {
        config.paths.raw_image_dir.clone()
    } else {
        std::env::temp_dir().join(TRANSIENT_FRAME_DIR)
    };
    Ok(Box::new(CommandCaptureSource::new(
        &config.capture,
        config.app.camera,
        dir,
        &config.paths.extension,
        keep,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotter_core::Error;

    #[test]
    fn test_timing_log_follows_file_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SpotterConfig::default();
        config.paths.timelog_dir = dir.path().to_path_buf();

        config.timing.file_write = Some(false);
        let log = build_timing_log(&config).unwrap();
        assert_eq!(log.title(), "software-detection");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        config.timing.file_write = Some(true);
        config.app.pipeline = PipelineMode::Hybrid;
        let log = build_timing_log(&config).unwrap();
        assert_eq!(log.title(), "hybrid-detection");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_setup_failure_is_recorded_and_reported() {
        let mut config = SpotterConfig::default();
        config.app.pipeline = PipelineMode::Hybrid;
        config.hybrid.layers_path = "/nonexistent/layers.json".into();
        let mut log = TimingLog::new("setup", false, None);

        let err = setup_stages(&config, &mut log).err().unwrap();
        assert!(matches!(err, Error::Io(_) | Error::Pipeline(_)));
        assert!(!log.has_open_trigger());
    }

    #[test]
    fn test_static_source_from_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("frame.jpg"), b"x").unwrap();
        let mut config = SpotterConfig::default();
        config.app.static_images = true;
        config.paths.input_image_dir = dir.path().to_path_buf();

        let mut source = build_source(&config).unwrap();
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }
}
