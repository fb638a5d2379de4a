//! Opaque capability providers
//!
//! The pipelines orchestrate; the numerical and hardware work is done by
//! whatever implements these traits. Production builds plug in the
//! direct convolution, the shared library bindings and (with the `onnx`
//! feature) ONNX Runtime. Tests plug in fakes.

use crate::error::VisionError;
use ndarray::{Array2, Array4};
use std::path::{Path, PathBuf};

/// Full network forward pass of the software path.
pub trait ForwardPass: Send {
    /// One tensor per output layer, each row `[cx, cy, w, h, objectness, class scores...]`
    /// with box coordinates relative to the image size.
    fn forward(&mut self, blob: &Array4<f32>) -> Result<Vec<Array2<f32>>, VisionError>;
}

/// Single software convolution layer on `(batch, x, y, channels)` tensors.
pub trait Convolution: Send {
    fn convolve(&self, input: &Array4<f32>) -> Result<Array4<f32>, VisionError>;
}

/// Device-side buffer in whatever packed format the accelerator uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorBuffer {
    words: Vec<u64>,
    elements: usize,
}

impl AcceleratorBuffer {
    /// `words` packed device words standing for `elements` logical values
    pub fn zeroed(words: usize, elements: usize) -> Self {
        Self {
            words: vec![0; words],
            elements,
        }
    }

    pub fn from_words(words: Vec<u64>, elements: usize) -> Self {
        Self { words, elements }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [u64] {
        &mut self.words
    }

    /// Number of logical values the buffer stands for
    pub fn elements(&self) -> usize {
        self.elements
    }
}

/// Hardware accelerator running the quantized middle layers.
///
/// One cycle is `allocate_output`, `prepare`, `infer`, `postprocess`.
pub trait AcceleratorDevice: Send {
    fn allocate_output(&mut self, channels: usize, dim: usize) -> Result<AcceleratorBuffer, VisionError>;

    /// Pack host values into a device input buffer
    fn prepare(&mut self, input: &[f32]) -> Result<AcceleratorBuffer, VisionError>;

    fn infer(
        &mut self,
        input: &AcceleratorBuffer,
        output: &mut AcceleratorBuffer,
    ) -> Result<(), VisionError>;

    /// Unpack a device output buffer into host values
    fn postprocess(&mut self, output: &AcceleratorBuffer) -> Result<Vec<f32>, VisionError>;
}

/// Arguments of one detection rendering call
#[derive(Debug, Clone)]
pub struct RenderRequest<'a> {
    /// Flat output of the last layer
    pub detections: &'a [f32],
    /// Image the boxes are drawn onto
    pub image_path: &'a Path,
    /// Output image path without extension
    pub output_stem: &'a Path,
    /// Side-channel file receiving `name: probability` lines
    pub probabilities_path: &'a Path,
    pub class_threshold: f32,
    pub hierarchy_threshold: f32,
}

/// Region decoding, box drawing and class scoring of the hybrid path.
pub trait DetectionRenderer: Send {
    /// Returns the path of the annotated image.
    fn draw_and_score(&mut self, request: &RenderRequest<'_>) -> Result<PathBuf, VisionError>;
}
