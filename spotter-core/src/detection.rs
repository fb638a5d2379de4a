//! Detection results and the publisher seam

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Absolute top-left box in pixels: x, y, width, height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxXywh {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoxXywh {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn to_array(&self) -> [i32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

/// Image a detection result refers to
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// Annotated image persisted on disk
    File(PathBuf),
    /// Encoded (JPEG) annotated image kept in memory
    Inline(Bytes),
}

impl ImageSource {
    /// Whether the publisher can attach the image
    pub fn is_available(&self) -> bool {
        match self {
            ImageSource::File(path) => path.is_file(),
            ImageSource::Inline(bytes) => !bytes.is_empty(),
        }
    }
}

/// Outcome of one completed pipeline run.
///
/// Built once, never mutated, and handed by value to exactly one publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    labels: Vec<String>,
    confidences: Vec<f32>,
    boxes: Option<Vec<BoxXywh>>,
    source: ImageSource,
}

impl DetectionResult {
    pub fn new(
        labels: Vec<String>,
        confidences: Vec<f32>,
        boxes: Option<Vec<BoxXywh>>,
        source: ImageSource,
    ) -> Result<Self> {
        if labels.len() != confidences.len() {
            return Err(Error::InvalidResult(format!(
                "{} labels but {} confidences",
                labels.len(),
                confidences.len()
            )));
        }
        if let Some(boxes) = &boxes {
            if boxes.len() != labels.len() {
                return Err(Error::InvalidResult(format!(
                    "{} labels but {} boxes",
                    labels.len(),
                    boxes.len()
                )));
            }
        }
        if let Some(bad) = confidences.iter().find(|c| !(0.0..=1.0).contains(*c)) {
            return Err(Error::InvalidResult(format!("confidence {} outside [0, 1]", bad)));
        }

        Ok(Self {
            labels,
            confidences,
            boxes,
            source,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn confidences(&self) -> &[f32] {
        &self.confidences
    }

    pub fn boxes(&self) -> Option<&[BoxXywh]> {
        self.boxes.as_deref()
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn source_path(&self) -> Option<&Path> {
        match &self.source {
            ImageSource::File(path) => Some(path),
            ImageSource::Inline(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Nothing detected is a normal terminal state of a cycle
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Downstream consumer of detection results (message bus, test double, ...)
pub trait ResultPublisher: Send {
    fn publish(&mut self, result: DetectionResult) -> Result<()>;
}
