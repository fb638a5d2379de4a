//! Error types for spotter-eye

use spotter_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    /// Tensor rank or size incompatible with a layout contract
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Accelerator call failed; the device cannot be retried in-process
    #[error("Accelerator fault: {0}")]
    AcceleratorFault(String),

    #[error("Renderer error: {0}")]
    Renderer(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Shared library error: {0}")]
    Library(#[from] libloading::Error),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl From<VisionError> for CoreError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::Core(inner) => inner,
            other => CoreError::Pipeline(other.to_string()),
        }
    }
}

impl From<ndarray::ShapeError> for VisionError {
    fn from(err: ndarray::ShapeError) -> Self {
        VisionError::ShapeMismatch(err.to_string())
    }
}

impl From<ndarray_npy::ReadNpyError> for VisionError {
    fn from(err: ndarray_npy::ReadNpyError) -> Self {
        VisionError::Model(format!("Failed to read npy array: {}", err))
    }
}
