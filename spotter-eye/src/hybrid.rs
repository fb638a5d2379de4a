//! Hybrid detection pipeline
//!
//! The network is split across the processor and the accelerator:
//!
//! 1. `load_image`: letterbox to a square planar tensor, interleave
//! 2. `first_layer`: software convolution, clip and quantize
//! 3. `accelerator_layers`: quantized middle layers on the accelerator
//! 4. `last_layer`: reorder the accelerator output, software convolution
//! 5. `detect`: region decoding and drawing by the renderer, scores read
//!    back from its probability file
//!
//! Each stage takes ownership of the previous stage's state, so the only
//! way to reach the accelerator is through a finished first layer.

use crate::capability::{AcceleratorDevice, Convolution, DetectionRenderer, RenderRequest};
use crate::conv::Conv2d;
use crate::error::VisionError;
use crate::hardware::{SharedLibraryAccelerator, SharedLibraryRenderer};
use crate::tensor::{self, QuantizedTensor};
use ndarray::{Array3, Array4};
use serde::Deserialize;
use spotter_core::config::HybridConfig;
use spotter_core::{DetectionResult, ImageSource};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Clip range of the first layer output before quantization
pub const FIRST_LAYER_CLIP: (f32, f32) = (0.0, 4.0);

/// Bit width the accelerator's first quantized layer expects
pub const FIRST_LAYER_BITS: u8 = 3;

/// Rescale of the quantized levels to the accelerator's input range.
/// Calibration value of the current bitstream; not known to hold for others.
pub const ACCELERATOR_INPUT_SCALE: f32 = 7.0;

/// Per-class probability threshold of the renderer
pub const CLASS_THRESHOLD: f32 = 0.3;

/// Hierarchical threshold of the renderer
pub const HIERARCHY_THRESHOLD: f32 = 0.5;

/// Input and output shape of one layer, `[channels, dim, dim]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LayerShape {
    pub input: Vec<usize>,
    pub output: Vec<usize>,
}

/// Layer shapes of the quantized network, keyed by layer name
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct NetworkLayout {
    layers: HashMap<String, LayerShape>,
}

impl NetworkLayout {
    pub fn from_file(path: &Path) -> Result<Self, VisionError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, VisionError> {
        serde_json::from_str(content)
            .map_err(|e| VisionError::Model(format!("Invalid layer description: {}", e)))
    }

    pub fn layer(&self, name: &str) -> Option<&LayerShape> {
        self.layers.get(name)
    }

    /// Output geometry of `name`
    pub fn output_geometry(&self, name: &str) -> Result<AcceleratorGeometry, VisionError> {
        let shape = self
            .layer(name)
            .ok_or_else(|| VisionError::Model(format!("layer '{}' not described", name)))?;
        match shape.output.as_slice() {
            [channels, dim, ..] if *channels > 0 && *dim > 0 => Ok(AcceleratorGeometry {
                channels: *channels,
                dim: *dim,
            }),
            other => Err(VisionError::ShapeMismatch(format!(
                "layer '{}' output {:?} is not [channels, dim, dim]",
                name, other
            ))),
        }
    }
}

/// Shape of the accelerator's output feature map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorGeometry {
    pub channels: usize,
    pub dim: usize,
}

impl AcceleratorGeometry {
    pub fn elements(&self) -> usize {
        self.channels * self.dim * self.dim
    }
}

#[derive(Debug, Clone)]
pub struct ImageLoaded {
    source: PathBuf,
    /// `(x, y, channels)`
    tensor: Array3<f32>,
}

impl ImageLoaded {
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn tensor(&self) -> &Array3<f32> {
        &self.tensor
    }
}

#[derive(Debug, Clone)]
pub struct FirstLayerDone {
    source: PathBuf,
    quantized: QuantizedTensor,
}

impl FirstLayerDone {
    pub fn quantized(&self) -> &QuantizedTensor {
        &self.quantized
    }
}

#[derive(Debug, Clone)]
pub struct AcceleratorDone {
    source: PathBuf,
    output: Vec<f32>,
}

impl AcceleratorDone {
    pub fn output(&self) -> &[f32] {
        &self.output
    }
}

#[derive(Debug, Clone)]
pub struct LastLayerDone {
    source: PathBuf,
    output: Array4<f32>,
}

impl LastLayerDone {
    pub fn output(&self) -> &Array4<f32> {
        &self.output
    }
}

/// Renderer outcome: annotated image plus `(class, probability)` pairs in
/// the order the renderer wrote them.
#[derive(Debug, Clone, PartialEq)]
pub struct Detected {
    image_path: PathBuf,
    probabilities_path: PathBuf,
    detections: Vec<(String, f32)>,
}

impl Detected {
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn probabilities_path(&self) -> &Path {
        &self.probabilities_path
    }

    pub fn detections(&self) -> &[(String, f32)] {
        &self.detections
    }

    /// Report lines, highest probability first
    pub fn report(&self) -> Vec<String> {
        probability_report(&self.detections)
    }

    pub fn into_result(self) -> Result<DetectionResult, VisionError> {
        let (labels, confidences) = self.detections.into_iter().unzip();
        Ok(DetectionResult::new(
            labels,
            confidences,
            None,
            ImageSource::File(self.image_path),
        )?)
    }
}

/// `name: probability` lines. A trailing `%` marks a percentage.
pub fn parse_probabilities(content: &str) -> Result<Vec<(String, f32)>, VisionError> {
    let mut detections = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (name, value) = line.split_once(": ").ok_or_else(|| {
            VisionError::Renderer(format!("probability line {} malformed: '{}'", number + 1, line))
        })?;
        let value = value.trim();
        let probability = match value.strip_suffix('%') {
            Some(percent) => percent.trim().parse::<f32>().map(|p| p / 100.0),
            None => value.parse::<f32>(),
        }
        .map_err(|e| {
            VisionError::Renderer(format!("probability line {} '{}': {}", number + 1, line, e))
        })?;
        if !(0.0..=1.0).contains(&probability) {
            return Err(VisionError::Renderer(format!(
                "probability line {} out of range: '{}'",
                number + 1,
                line
            )));
        }

        detections.push((name.trim().to_string(), probability));
    }
    Ok(detections)
}

pub fn probability_report(detections: &[(String, f32)]) -> Vec<String> {
    let mut sorted: Vec<&(String, f32)> = detections.iter().collect();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    sorted
        .into_iter()
        .map(|(name, p)| format!("class: {}\tprobability: {}", name, p))
        .collect()
}

pub struct HybridPipeline {
    first_layer: Box<dyn Convolution>,
    last_layer: Box<dyn Convolution>,
    accelerator: Box<dyn AcceleratorDevice>,
    renderer: Box<dyn DetectionRenderer>,
    geometry: AcceleratorGeometry,
    input_size: u32,
    output_dir: PathBuf,
}

impl HybridPipeline {
    pub fn new(
        first_layer: Box<dyn Convolution>,
        last_layer: Box<dyn Convolution>,
        accelerator: Box<dyn AcceleratorDevice>,
        renderer: Box<dyn DetectionRenderer>,
        geometry: AcceleratorGeometry,
        input_size: u32,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            first_layer,
            last_layer,
            accelerator,
            renderer,
            geometry,
            input_size,
            output_dir: output_dir.into(),
        }
    }

    /// Load weights and layer shapes, open the renderer and claim the
    /// accelerator. Failing to claim the accelerator is fatal for hybrid mode.
    pub fn from_config(config: &HybridConfig, output_dir: impl Into<PathBuf>) -> Result<Self, VisionError> {
        let layout = NetworkLayout::from_file(&config.layers_path)?;
        let geometry = layout.output_geometry(&config.accelerator_output_layer)?;
        let first_layer = Conv2d::from_config(&config.first_layer)?;
        let last_layer = Conv2d::from_config(&config.last_layer)?;
        let renderer = SharedLibraryRenderer::open(
            &config.renderer_library,
            &config.names_path,
            &config.renderer_data_dir,
        )?;
        let accelerator = SharedLibraryAccelerator::open(&config.accelerator_library)?;

        info!(
            "Hybrid pipeline ready: accelerator output {}x{}x{}",
            geometry.channels, geometry.dim, geometry.dim
        );
        Ok(Self::new(
            Box::new(first_layer),
            Box::new(last_layer),
            Box::new(accelerator),
            Box::new(renderer),
            geometry,
            config.input_size,
            output_dir,
        ))
    }

    pub fn geometry(&self) -> AcceleratorGeometry {
        self.geometry
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn load_image(&self, path: &Path) -> Result<ImageLoaded, VisionError> {
        let image = image::open(path)?.to_rgb8();
        let planar = tensor::letterbox(&image, self.input_size)?;
        debug!("Letterboxed {:?} to {}", path, self.input_size);
        Ok(ImageLoaded {
            source: path.to_path_buf(),
            tensor: tensor::planar_to_interleaved(planar),
        })
    }

    pub fn first_layer(&self, loaded: ImageLoaded) -> Result<FirstLayerDone, VisionError> {
        let batched = tensor::to_channel_first_batched(loaded.tensor)?;
        let output = self.first_layer.convolve(&batched)?;
        let (lo, hi) = FIRST_LAYER_CLIP;
        let quantized = tensor::quantize_clip(&output, lo, hi, FIRST_LAYER_BITS)?;
        debug!("First layer output {:?}", quantized.levels().shape());
        Ok(FirstLayerDone {
            source: loaded.source,
            quantized,
        })
    }

    /// Any failure here is an accelerator fault.
    pub fn accelerator_layers(&mut self, first: FirstLayerDone) -> Result<AcceleratorDone, VisionError> {
        let input = tensor::flatten(&first.quantized.scaled(ACCELERATOR_INPUT_SCALE));
        let output = self.run_accelerator(&input).map_err(into_accelerator_fault)?;
        Ok(AcceleratorDone {
            source: first.source,
            output,
        })
    }

    fn run_accelerator(&mut self, input: &[f32]) -> Result<Vec<f32>, VisionError> {
        let AcceleratorGeometry { channels, dim } = self.geometry;
        let mut device_output = self.accelerator.allocate_output(channels, dim)?;
        let device_input = self.accelerator.prepare(input)?;
        self.accelerator.infer(&device_input, &mut device_output)?;
        let output = self.accelerator.postprocess(&device_output)?;

        if output.len() != self.geometry.elements() {
            return Err(VisionError::AcceleratorFault(format!(
                "accelerator returned {} values, expected {}",
                output.len(),
                self.geometry.elements()
            )));
        }
        Ok(output)
    }

    pub fn last_layer(&self, accelerated: AcceleratorDone) -> Result<LastLayerDone, VisionError> {
        let AcceleratorGeometry { channels, dim } = self.geometry;
        let input = tensor::hw_output_to_sw_input(&accelerated.output, dim, channels)?;
        let output = self.last_layer.convolve(&input)?;
        debug!("Last layer output {:?}", output.shape());
        Ok(LastLayerDone {
            source: accelerated.source,
            output,
        })
    }

    /// Writes `<output_dir>/<stem>_hw_detection.png` and the probability
    /// side-channel `<stem>_hw_detection_probabilities.txt` next to it.
    pub fn detect(&mut self, last: LastLayerDone) -> Result<Detected, VisionError> {
        let stem = last
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "frame".to_string());
        let output_stem = absolute(&self.output_dir.join(format!("{}_hw_detection", stem)))?;
        let probabilities_path = PathBuf::from(format!(
            "{}_probabilities.txt",
            output_stem.to_string_lossy()
        ));

        // the renderer appends; start from an empty side channel
        std::fs::File::create(&probabilities_path)?;

        let detections = tensor::flatten(&last.output);
        let request = RenderRequest {
            detections: &detections,
            image_path: &last.source,
            output_stem: &output_stem,
            probabilities_path: &probabilities_path,
            class_threshold: CLASS_THRESHOLD,
            hierarchy_threshold: HIERARCHY_THRESHOLD,
        };
        let image_path = self.renderer.draw_and_score(&request)?;

        let content = std::fs::read_to_string(&probabilities_path)?;
        let detections = parse_probabilities(&content)?;
        let detected = Detected {
            image_path,
            probabilities_path,
            detections,
        };
        for line in detected.report() {
            debug!("{}", line);
        }
        info!("Renderer reported {} detections", detected.detections.len());
        Ok(detected)
    }
}

fn absolute(path: &Path) -> Result<PathBuf, VisionError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn into_accelerator_fault(err: VisionError) -> VisionError {
    match err {
        VisionError::AcceleratorFault(_) => err,
        other => VisionError::AcceleratorFault(other.to_string()),
    }
}
