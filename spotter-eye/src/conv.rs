//! Direct convolution for the software layers of the hybrid path

use crate::capability::Convolution;
use crate::error::VisionError;
use ndarray::{Array1, Array4};
use ndarray_npy::read_npy;
use spotter_core::config::ConvLayerConfig;
use std::path::Path;
use tracing::info;

/// Convolution over `(batch, x, y, channels)` tensors.
///
/// Weights are kept as `(kx, ky, in, out)`, the darknet `(out, in, kh, kw)`
/// order with all axes reversed.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weights: Array4<f32>,
    bias: Array1<f32>,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    /// Build from darknet ordered `(out, in, kh, kw)` weights.
    pub fn new(
        darknet_weights: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
    ) -> Result<Self, VisionError> {
        if stride == 0 {
            return Err(VisionError::Model("convolution stride must be > 0".to_string()));
        }
        let out_channels = darknet_weights.shape()[0];
        if bias.len() != out_channels {
            return Err(VisionError::ShapeMismatch(format!(
                "{} output channels but {} bias values",
                out_channels,
                bias.len()
            )));
        }

        let weights = darknet_weights
            .permuted_axes([3, 2, 1, 0])
            .as_standard_layout()
            .into_owned();
        Ok(Self {
            weights,
            bias,
            stride,
            padding,
        })
    }

    pub fn from_npy(
        weights_path: &Path,
        bias_path: &Path,
        stride: usize,
        padding: usize,
    ) -> Result<Self, VisionError> {
        let weights: Array4<f32> = read_f32_npy(weights_path)?;
        let bias: Array1<f32> = read_f32_npy(bias_path)?;
        info!(
            "Loaded convolution weights {:?} {:?} from {:?}",
            weights.shape(),
            bias.shape(),
            weights_path
        );
        Self::new(weights, bias, stride, padding)
    }

    pub fn from_config(config: &ConvLayerConfig) -> Result<Self, VisionError> {
        Self::from_npy(
            &config.weights_path,
            &config.bias_path,
            config.stride,
            config.padding,
        )
    }

    pub fn in_channels(&self) -> usize {
        self.weights.shape()[2]
    }

    pub fn out_channels(&self) -> usize {
        self.weights.shape()[3]
    }

    fn output_extent(&self, extent: usize, kernel: usize) -> Result<usize, VisionError> {
        let padded = extent + 2 * self.padding;
        if padded < kernel {
            return Err(VisionError::ShapeMismatch(format!(
                "input extent {} (padding {}) smaller than kernel {}",
                extent, self.padding, kernel
            )));
        }
        Ok((padded - kernel) / self.stride + 1)
    }
}

fn read_f32_npy<D>(path: &Path) -> Result<ndarray::Array<f32, D>, VisionError>
where
    D: ndarray::Dimension,
{
    match read_npy::<_, ndarray::Array<f32, D>>(path) {
        Ok(array) => Ok(array),
        // weights exported as float64
        Err(ndarray_npy::ReadNpyError::WrongDescriptor(_)) => {
            let wide: ndarray::Array<f64, D> = read_npy(path)?;
            Ok(wide.mapv(|v| v as f32))
        }
        Err(e) => Err(VisionError::Model(format!("{}: {}", path.display(), e))),
    }
}

impl Convolution for Conv2d {
    fn convolve(&self, input: &Array4<f32>) -> Result<Array4<f32>, VisionError> {
        let (kx, ky, in_ch, out_ch) = self.weights.dim();
        let (batch, width, height, channels) = input.dim();
        if channels != in_ch {
            return Err(VisionError::ShapeMismatch(format!(
                "convolution expects {} input channels, tensor has {} (shape {:?})",
                in_ch,
                channels,
                input.shape()
            )));
        }

        let out_w = self.output_extent(width, kx)?;
        let out_h = self.output_extent(height, ky)?;
        let pad = self.padding as isize;

        let input = input.as_standard_layout();
        let src = input
            .as_slice()
            .ok_or_else(|| VisionError::Processing("input tensor not contiguous".to_string()))?;
        let weights = self
            .weights
            .as_slice()
            .ok_or_else(|| VisionError::Processing("weights not contiguous".to_string()))?;
        let bias = self.bias.to_vec();

        let mut out = vec![0.0f32; batch * out_w * out_h * out_ch];
        for n in 0..batch {
            for ox in 0..out_w {
                for oy in 0..out_h {
                    let base = ((n * out_w + ox) * out_h + oy) * out_ch;
                    let acc = &mut out[base..base + out_ch];
                    acc.copy_from_slice(&bias);

                    for dx in 0..kx {
                        let ix = (ox * self.stride + dx) as isize - pad;
                        if ix < 0 || ix >= width as isize {
                            continue;
                        }
                        for dy in 0..ky {
                            let iy = (oy * self.stride + dy) as isize - pad;
                            if iy < 0 || iy >= height as isize {
                                continue;
                            }
                            let pixel = ((n * width + ix as usize) * height + iy as usize) * channels;
                            for ci in 0..in_ch {
                                let value = src[pixel + ci];
                                if value == 0.0 {
                                    continue;
                                }
                                let w = ((dx * ky + dy) * in_ch + ci) * out_ch;
                                for (a, k) in acc.iter_mut().zip(&weights[w..w + out_ch]) {
                                    *a += value * k;
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(Array4::from_shape_vec((batch, out_w, out_h, out_ch), out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array};

    #[test]
    fn test_identity_kernel_keeps_input() {
        // one 1x1 kernel copying the single input channel
        let weights = Array::from_elem((1, 1, 1, 1), 1.0f32);
        let conv = Conv2d::new(weights, arr1(&[0.0]), 1, 0).unwrap();
        let input = Array4::from_shape_fn((1, 3, 2, 1), |(_, x, y, _)| (x * 10 + y) as f32);
        let out = conv.convolve(&input).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_stride_padding_output_shape() {
        let weights = Array4::<f32>::zeros((16, 3, 3, 3));
        let conv = Conv2d::new(weights, Array1::zeros(16), 2, 1).unwrap();
        let input = Array4::<f32>::zeros((1, 416, 416, 3));
        let out = conv.convolve(&input).unwrap();
        assert_eq!(out.shape(), &[1, 208, 208, 16]);
    }

    #[test]
    fn test_bias_and_sum() {
        // 2x2 kernel of ones over a 2x2 single channel input plus bias
        let weights = Array4::from_elem((1, 1, 2, 2), 1.0f32);
        let conv = Conv2d::new(weights, arr1(&[0.5]), 1, 0).unwrap();
        let input = Array4::from_shape_vec((1, 2, 2, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = conv.convolve(&input).unwrap();
        assert_eq!(out.shape(), &[1, 1, 1, 1]);
        assert_eq!(out[[0, 0, 0, 0]], 10.5);
    }

    #[test]
    fn test_weight_axes_reversed() {
        // darknet (out=2, in=1, kh=1, kw=1): out channel 1 doubles the input
        let weights = Array4::from_shape_vec((2, 1, 1, 1), vec![1.0, 2.0]).unwrap();
        let conv = Conv2d::new(weights, Array1::zeros(2), 1, 0).unwrap();
        assert_eq!(conv.in_channels(), 1);
        assert_eq!(conv.out_channels(), 2);
        let input = Array4::from_elem((1, 1, 1, 1), 3.0f32);
        let out = conv.convolve(&input).unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 3.0);
        assert_eq!(out[[0, 0, 0, 1]], 6.0);
    }

    #[test]
    fn test_channel_mismatch() {
        let conv = Conv2d::new(Array4::zeros((4, 3, 1, 1)), Array1::zeros(4), 1, 0).unwrap();
        let input = Array4::<f32>::zeros((1, 2, 2, 5));
        assert!(matches!(conv.convolve(&input), Err(VisionError::ShapeMismatch(_))));
    }

    #[test]
    fn test_invalid_construction() {
        assert!(Conv2d::new(Array4::zeros((4, 3, 1, 1)), Array1::zeros(3), 1, 0).is_err());
        assert!(Conv2d::new(Array4::zeros((4, 3, 1, 1)), Array1::zeros(4), 0, 0).is_err());
    }

    #[test]
    fn test_from_npy() {
        let dir = tempfile::tempdir().unwrap();
        let weights_path = dir.path().join("conv-W.npy");
        let bias_path = dir.path().join("conv-bias.npy");
        ndarray_npy::write_npy(&weights_path, &Array4::<f32>::ones((2, 1, 1, 1))).unwrap();
        ndarray_npy::write_npy(&bias_path, &arr1(&[0.0f64, 1.0])).unwrap();

        let conv = Conv2d::from_npy(&weights_path, &bias_path, 1, 0).unwrap();
        let out = conv.convolve(&Array4::from_elem((1, 1, 1, 1), 2.0)).unwrap();
        assert_eq!(out[[0, 0, 0, 1]], 3.0);
    }
}
