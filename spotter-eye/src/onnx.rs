//! ONNX Runtime forward pass for the software path

use crate::capability::ForwardPass;
use crate::error::VisionError;
use crate::tensor;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use tracing::{debug, info};

/// Network loaded into an ONNX Runtime session.
///
/// Every model output must be a `(…, records, values)` tensor; leading axes
/// are folded into the record axis.
pub struct OnnxNetwork {
    session: Session,
    output_names: Vec<String>,
}

impl OnnxNetwork {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        let session = Session::builder()
            .and_then(|builder| builder.commit_from_file(model_path))
            .map_err(|e| VisionError::Model(format!("Failed to load {:?}: {}", model_path, e)))?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        info!("ONNX model loaded from {:?} with outputs {:?}", model_path, output_names);
        Ok(Self {
            session,
            output_names,
        })
    }
}

impl ForwardPass for OnnxNetwork {
    fn forward(&mut self, blob: &Array4<f32>) -> Result<Vec<Array2<f32>>, VisionError> {
        let shape: Vec<i64> = blob.shape().iter().map(|&d| d as i64).collect();
        let input = Tensor::from_array((shape, tensor::flatten(blob)))
            .map_err(|e| VisionError::Model(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| VisionError::Model(format!("Forward pass failed: {}", e)))?;

        let mut layers = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let (shape, data) = outputs[name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| VisionError::Model(format!("Output '{}': {}", name, e)))?;
            let columns = shape.last().copied().unwrap_or(0).max(0) as usize;
            if columns == 0 || data.len() % columns != 0 {
                return Err(VisionError::ShapeMismatch(format!(
                    "output '{}' has shape {:?}",
                    name, shape
                )));
            }
            debug!("Output '{}' shape {:?}", name, shape);
            layers.push(Array2::from_shape_vec((data.len() / columns, columns), data.to_vec())?);
        }
        Ok(layers)
    }
}
