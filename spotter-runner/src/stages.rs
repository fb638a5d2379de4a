//! Pipeline stages bracketed on the timed event log

use crate::acquisition::Frame;
use spotter_core::{DetectionResult, Error as CoreError, ImageSource, PipelineMode, TimingLog};
use spotter_eye::{HybridPipeline, SoftwarePipeline, VisionError};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Timestamp and duration labels of one measured stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLabels {
    pub begin: &'static str,
    pub end: &'static str,
    pub name: &'static str,
}

pub const SETUP: StageLabels = StageLabels {
    begin: "setup pipeline begin",
    end: "setup pipeline end",
    name: "Setup Pipeline",
};

pub const IMAGE_LOADING: StageLabels = StageLabels {
    begin: "load image begin",
    end: "load image end",
    name: "Image Loading",
};

pub const SW_CONV_LAYERS: StageLabels = StageLabels {
    begin: "sw conv layers begin",
    end: "sw conv layers end",
    name: "Apply SW Conv Layers",
};

pub const SW_FIRST_LAYER: StageLabels = StageLabels {
    begin: "sw conv layer 0 begin",
    end: "sw conv layer 0 end",
    name: "Apply SW Conv Layer 0",
};

pub const HW_LAYERS: StageLabels = StageLabels {
    begin: "hw conv layers 1-7 begin",
    end: "hw conv layers 1-7 end",
    name: "Apply HW Conv Layers 1-7",
};

pub const SW_LAST_LAYER: StageLabels = StageLabels {
    begin: "sw conv layer 8 begin",
    end: "sw conv layer 8 end",
    name: "Apply SW Conv Layer 8",
};

pub const DRAW_DETECTIONS: StageLabels = StageLabels {
    begin: "detection begin",
    end: "detection end",
    name: "Draw Detection Boxes",
};

#[derive(Error, Debug)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: &'static str,
    #[source]
    pub source: CoreError,
}

/// Run `f` between a begin and an end timestamp.
///
/// A failing stage closes its open timestamp with the aborted sentinel.
pub fn timed<T, E>(
    log: &mut TimingLog,
    labels: &StageLabels,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, StageError>
where
    E: Into<CoreError>,
{
    log.trigger(Some(labels.begin));
    match f() {
        Ok(value) => {
            log.end(Some(labels.end), Some(labels.name))
                .map_err(|source| StageError {
                    stage: labels.name,
                    source,
                })?;
            Ok(value)
        }
        Err(e) => {
            log.abort(Some(labels.name));
            Err(StageError {
                stage: labels.name,
                source: e.into(),
            })
        }
    }
}

/// One complete detection run over a frame
pub trait DetectionStages: Send {
    fn mode(&self) -> PipelineMode;

    fn process(&mut self, frame: &Frame, log: &mut TimingLog) -> Result<DetectionResult, StageError>;
}

pub struct SoftwareStages {
    pipeline: SoftwarePipeline,
    /// Annotated images are written here; published inline when absent
    save_dir: Option<PathBuf>,
}

impl SoftwareStages {
    pub fn new(pipeline: SoftwarePipeline, save_dir: Option<PathBuf>) -> Self {
        Self { pipeline, save_dir }
    }
}

impl DetectionStages for SoftwareStages {
    fn mode(&self) -> PipelineMode {
        PipelineMode::Software
    }

    fn process(&mut self, frame: &Frame, log: &mut TimingLog) -> Result<DetectionResult, StageError> {
        let pipeline = &mut self.pipeline;
        let save_dir = self.save_dir.as_deref();

        let loaded = timed(log, &IMAGE_LOADING, || pipeline.load(frame.path()))?;
        let forwarded = timed(log, &SW_CONV_LAYERS, || pipeline.forward(loaded))?;
        let (drawn, source) = timed(log, &DRAW_DETECTIONS, || {
            let drawn = pipeline.annotate(pipeline.detect(forwarded)?);
            let source = match save_dir {
                Some(dir) => ImageSource::File(drawn.save(dir)?),
                None => ImageSource::Inline(drawn.encode_jpeg()?),
            };
            Ok::<_, VisionError>((drawn, source))
        })?;

        debug!("{} detection(s) in {:?}", drawn.detections().len(), frame.path());
        drawn.into_result(source).map_err(|e| StageError {
            stage: DRAW_DETECTIONS.name,
            source: e.into(),
        })
    }
}

pub struct HybridStages {
    pipeline: HybridPipeline,
}

impl HybridStages {
    pub fn new(pipeline: HybridPipeline) -> Self {
        Self { pipeline }
    }
}

impl DetectionStages for HybridStages {
    fn mode(&self) -> PipelineMode {
        PipelineMode::Hybrid
    }

    fn process(&mut self, frame: &Frame, log: &mut TimingLog) -> Result<DetectionResult, StageError> {
        let pipeline = &mut self.pipeline;

        let loaded = timed(log, &IMAGE_LOADING, || pipeline.load_image(frame.path()))?;
        let first = timed(log, &SW_FIRST_LAYER, || pipeline.first_layer(loaded))?;
        let accelerated = timed(log, &HW_LAYERS, || pipeline.accelerator_layers(first))?;
        let last = timed(log, &SW_LAST_LAYER, || pipeline.last_layer(accelerated))?;
        let detected = timed(log, &DRAW_DETECTIONS, || pipeline.detect(last))?;

        detected.into_result().map_err(|e| StageError {
            stage: DRAW_DETECTIONS.name,
            source: e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotter_core::{EventKind, MemorySink, Moment};

    #[test]
    fn test_timed_success_records_duration() {
        let sink = MemorySink::new();
        let mut log = TimingLog::new("test", false, Some(Box::new(sink.clone())));

        let value = timed(&mut log, &IMAGE_LOADING, || Ok::<_, CoreError>(7)).unwrap();
        assert_eq!(value, 7);

        let rows = sink.snapshot();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].label.as_deref(), Some("load image begin"));
        assert_eq!(rows[1].label.as_deref(), Some("load image end"));
        assert_eq!(rows[2].kind, EventKind::Duration);
        assert_eq!(rows[2].label.as_deref(), Some("Image Loading"));
        assert!(!log.has_open_trigger());
    }

    #[test]
    fn test_timed_failure_records_abort() {
        let sink = MemorySink::new();
        let mut log = TimingLog::new("test", false, Some(Box::new(sink.clone())));

        let err = timed(&mut log, &HW_LAYERS, || {
            Err::<(), _>(VisionError::AcceleratorFault("infer returned 3".to_string()))
        })
        .unwrap_err();
        assert_eq!(err.stage, "Apply HW Conv Layers 1-7");
        assert!(err.to_string().contains("infer returned 3"));

        let rows = sink.snapshot();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].moment, Moment::Aborted);
        assert_eq!(rows[2].label.as_deref(), Some("Apply HW Conv Layers 1-7"));
        assert!(!log.has_open_trigger());
    }
}
