//! Tensor layout adapter
//!
//! Stateless transforms between the layouts each pipeline stage expects.
//! They are the only place where a tensor changes layout; everything else
//! hands tensors through untouched.
//!
//! Conventions:
//! - decoded images are planar `(channels, rows, cols)` with values in [0, 1]
//! - the software convolutions work on batched interleaved tensors
//!   `(batch, x, y, channels)`
//! - the accelerator consumes and produces flat buffers

use crate::error::VisionError;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::{Array3, Array4, Axis};

/// Fill value of the letterbox border
pub const LETTERBOX_FILL: f32 = 0.5;

/// Insert the leading batch axis in front of a 3-D tensor.
pub fn to_channel_first_batched(tensor: Array3<f32>) -> Result<Array4<f32>, VisionError> {
    if tensor.is_empty() {
        return Err(VisionError::ShapeMismatch(format!(
            "cannot batch an empty tensor of shape {:?}",
            tensor.shape()
        )));
    }
    Ok(tensor.insert_axis(Axis(0)))
}

/// Tensor of quantization levels in [0, 1] plus what is needed to map it back.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    levels: Array4<f32>,
    lo: f32,
    hi: f32,
    bits: u8,
}

impl QuantizedTensor {
    pub fn levels(&self) -> &Array4<f32> {
        &self.levels
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn range(&self) -> (f32, f32) {
        (self.lo, self.hi)
    }

    /// Levels multiplied by `factor`
    pub fn scaled(&self, factor: f32) -> Array4<f32> {
        self.levels.mapv(|v| v * factor)
    }
}

/// Clip to `[lo, hi]`, rescale to [0, 1] and round to `bits`-bit levels.
pub fn quantize_clip(
    tensor: &Array4<f32>,
    lo: f32,
    hi: f32,
    bits: u8,
) -> Result<QuantizedTensor, VisionError> {
    if !(1..=16).contains(&bits) {
        return Err(VisionError::Processing(format!(
            "quantization bit width must be within 1..=16, got {}",
            bits
        )));
    }
    if !(lo.is_finite() && hi.is_finite() && hi > lo) {
        return Err(VisionError::Processing(format!(
            "invalid clip range [{}, {}]",
            lo, hi
        )));
    }

    let steps = ((1u32 << bits) - 1) as f32;
    let span = hi - lo;
    let levels = tensor.mapv(|x| {
        if x.is_nan() {
            return 0.0;
        }
        let unit = (x.clamp(lo, hi) - lo) / span;
        (unit * steps).round() / steps
    });

    Ok(QuantizedTensor { levels, lo, hi, bits })
}

/// Map quantization levels back into the clip range.
pub fn dequantize(tensor: &QuantizedTensor) -> Array4<f32> {
    let span = tensor.hi - tensor.lo;
    tensor.levels.mapv(|v| tensor.lo + v * span)
}

/// Reshape the flat accelerator output for the last software layer.
///
/// The accelerator writes its feature map with the two spatial axes in the
/// opposite order from the one the software convolution reads. This is a
/// fixed property of the accelerator's output convention, not a general
/// transpose: `out[0, i, j, c] = flat[(j * dim + i) * channels + c]`.
pub fn hw_output_to_sw_input(
    flat: &[f32],
    dim: usize,
    channels: usize,
) -> Result<Array4<f32>, VisionError> {
    let expected = dim
        .checked_mul(dim)
        .and_then(|n| n.checked_mul(channels))
        .ok_or_else(|| VisionError::ShapeMismatch("accelerator geometry overflows".to_string()))?;
    if expected == 0 || flat.len() != expected {
        return Err(VisionError::ShapeMismatch(format!(
            "accelerator output holds {} values, geometry {}x{}x{} needs {}",
            flat.len(),
            dim,
            dim,
            channels,
            expected
        )));
    }

    let reshaped = Array3::from_shape_vec((dim, dim, channels), flat.to_vec())?;
    let swapped = reshaped.permuted_axes([1, 0, 2]).as_standard_layout().into_owned();
    Ok(swapped.insert_axis(Axis(0)))
}

/// Network input blob `(1, 3, size, size)`: plain resize (no crop), RGB
/// channel order, scaled by 1/255.
pub fn image_to_blob(image: &RgbImage, size: u32) -> Result<Array4<f32>, VisionError> {
    ensure_drawable(image, size)?;
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let side = size as usize;
    Ok(Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    }))
}

/// Aspect preserving resize into a `(3, size, size)` planar tensor, the
/// border filled with [`LETTERBOX_FILL`].
pub fn letterbox(image: &RgbImage, size: u32) -> Result<Array3<f32>, VisionError> {
    ensure_drawable(image, size)?;
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale) as u32).clamp(1, size);
    let new_h = ((height as f32 * scale) as u32).clamp(1, size);
    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let dx = ((size - new_w) / 2) as usize;
    let dy = ((size - new_h) / 2) as usize;
    let side = size as usize;
    let mut tensor = Array3::from_elem((3, side, side), LETTERBOX_FILL);
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[c, y as usize + dy, x as usize + dx]] = pixel[c] as f32 / 255.0;
        }
    }
    Ok(tensor)
}

/// `(channels, rows, cols)` to `(cols, rows, channels)`
pub fn planar_to_interleaved(tensor: Array3<f32>) -> Array3<f32> {
    tensor.permuted_axes([2, 1, 0]).as_standard_layout().into_owned()
}

/// Row-major copy of any tensor, as handed to flat-buffer consumers
pub fn flatten<D: ndarray::Dimension>(tensor: &ndarray::Array<f32, D>) -> Vec<f32> {
    tensor.iter().copied().collect()
}

fn ensure_drawable(image: &RgbImage, size: u32) -> Result<(), VisionError> {
    if image.width() == 0 || image.height() == 0 || size == 0 {
        return Err(VisionError::ShapeMismatch(format!(
            "cannot resize a {}x{} image to {}",
            image.width(),
            image.height(),
            size
        )));
    }
    Ok(())
}
