//! spotter-eye: detection pipelines for spotter
//!
//! Two interchangeable ways of turning an image into detections:
//!
//! - [`software::SoftwarePipeline`] runs the full network on the processor
//! - [`hybrid::HybridPipeline`] runs the first and last convolution in
//!   software and the quantized middle layers on an FPGA accelerator
//!
//! Layout changes between stages live in [`tensor`]; numerical and
//! hardware work sits behind the traits in [`capability`].

pub mod annotate;
pub mod capability;
pub mod conv;
pub mod error;
pub mod hardware;
pub mod hybrid;
pub mod nms;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod software;
pub mod tensor;

pub use capability::{AcceleratorBuffer, AcceleratorDevice, Convolution, DetectionRenderer, ForwardPass, RenderRequest};
pub use conv::Conv2d;
pub use error::VisionError;
pub use hybrid::HybridPipeline;
pub use software::SoftwarePipeline;
