//! Software detection pipeline
//!
//! Whole network on the general-purpose processor:
//! `load -> forward -> detect -> annotate`. Each step consumes the state
//! produced by the previous one, so stages cannot run out of order.

use crate::annotate::{self, Palette, PALETTE_SEED};
use crate::capability::ForwardPass;
use crate::error::VisionError;
use crate::nms;
use crate::tensor;
use image::RgbImage;
use ndarray::Array2;
use spotter_core::config::SoftwareConfig;
use spotter_core::{BoxXywh, DetectionResult, ImageSource};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Index of the first class score in a detection row
const CLASS_SCORES_OFFSET: usize = 5;

/// Thresholds and input geometry of the software path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftwareSettings {
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
    pub nms_score_threshold: f32,
}

impl Default for SoftwareSettings {
    fn default() -> Self {
        Self {
            input_size: 416,
            confidence_threshold: 0.3,
            nms_iou_threshold: 0.3,
            nms_score_threshold: 0.3,
        }
    }
}

impl From<&SoftwareConfig> for SoftwareSettings {
    fn from(config: &SoftwareConfig) -> Self {
        Self {
            input_size: config.input_size,
            confidence_threshold: config.confidence_threshold,
            nms_iou_threshold: config.nms_iou_threshold,
            nms_score_threshold: config.nms_score_threshold,
        }
    }
}

/// Candidates above the confidence threshold, in emission order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDetections {
    pub boxes: Vec<BoxXywh>,
    pub confidences: Vec<f32>,
    pub class_ids: Vec<usize>,
}

impl RawDetections {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Best class of every detection row above `threshold`, box scaled to
/// absolute top-left pixels.
pub fn extract_detections(
    outputs: &[Array2<f32>],
    width: u32,
    height: u32,
    threshold: f32,
) -> Result<RawDetections, VisionError> {
    let (w, h) = (width as f32, height as f32);
    let mut raw = RawDetections::default();

    for (layer, output) in outputs.iter().enumerate() {
        if output.ncols() <= CLASS_SCORES_OFFSET {
            return Err(VisionError::ShapeMismatch(format!(
                "output layer {} rows hold {} values, need more than {}",
                layer,
                output.ncols(),
                CLASS_SCORES_OFFSET
            )));
        }

        for row in output.rows() {
            let mut class_id = 0;
            let mut confidence = f32::NEG_INFINITY;
            for (i, &score) in row.iter().skip(CLASS_SCORES_OFFSET).enumerate() {
                if score > confidence {
                    confidence = score;
                    class_id = i;
                }
            }
            if !(confidence > threshold) {
                continue;
            }

            let (cx, cy) = (row[0] * w, row[1] * h);
            let (bw, bh) = (row[2] * w, row[3] * h);
            raw.boxes.push(BoxXywh::new(
                (cx - bw / 2.0).round() as i32,
                (cy - bh / 2.0).round() as i32,
                bw.round() as i32,
                bh.round() as i32,
            ));
            raw.confidences.push(confidence.min(1.0));
            raw.class_ids.push(class_id);
        }
    }

    Ok(raw)
}

/// One line per class name, blank lines ignored
pub fn load_labels(path: &Path) -> Result<Vec<String>, VisionError> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_labels(&content))
}

pub fn parse_labels(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Kept detection
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoxXywh,
}

#[derive(Debug, Clone)]
pub struct Loaded {
    image: RgbImage,
    source: Option<PathBuf>,
}

impl Loaded {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

#[derive(Debug, Clone)]
pub struct Forwarded {
    loaded: Loaded,
    outputs: Vec<Array2<f32>>,
}

impl Forwarded {
    pub fn outputs(&self) -> &[Array2<f32>] {
        &self.outputs
    }
}

#[derive(Debug, Clone)]
pub struct Detected {
    loaded: Loaded,
    detections: Vec<Detection>,
}

impl Detected {
    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }
}

/// Annotated image plus its detections
#[derive(Debug, Clone)]
pub struct Drawn {
    image: RgbImage,
    detections: Vec<Detection>,
    source: Option<PathBuf>,
}

impl Drawn {
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    /// Write `<dir>/<stem>_sw_detection<ext>` where stem and extension come
    /// from the loaded file (`frame` / `.jpg` for in-memory images).
    pub fn save(&self, dir: &Path) -> Result<PathBuf, VisionError> {
        let (stem, extension) = match &self.source {
            Some(path) => (
                path.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "frame".to_string()),
                path.extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_else(|| "jpg".to_string()),
            ),
            None => ("frame".to_string(), "jpg".to_string()),
        };
        let path = dir.join(format!("{}_sw_detection.{}", stem, extension));
        self.image.save(&path)?;
        debug!("Saved annotated image to {:?}", path);
        Ok(path)
    }

    pub fn encode_jpeg(&self) -> Result<bytes::Bytes, VisionError> {
        annotate::encode_jpeg(&self.image, 90)
    }

    pub fn into_result(self, source: ImageSource) -> Result<DetectionResult, VisionError> {
        let labels = self.detections.iter().map(|d| d.label.clone()).collect();
        let confidences = self.detections.iter().map(|d| d.confidence).collect();
        let boxes = self.detections.iter().map(|d| d.bbox).collect();
        Ok(DetectionResult::new(labels, confidences, Some(boxes), source)?)
    }
}

pub struct SoftwarePipeline {
    network: Box<dyn ForwardPass>,
    labels: Vec<String>,
    palette: Palette,
    settings: SoftwareSettings,
}

impl SoftwarePipeline {
    pub fn new(
        network: Box<dyn ForwardPass>,
        labels: Vec<String>,
        settings: SoftwareSettings,
    ) -> Self {
        let palette = Palette::seeded(labels.len(), PALETTE_SEED);
        Self {
            network,
            labels,
            palette,
            settings,
        }
    }

    /// Build from configuration with the ONNX Runtime network
    #[cfg(feature = "onnx")]
    pub fn from_config(config: &SoftwareConfig) -> Result<Self, VisionError> {
        let network = crate::onnx::OnnxNetwork::load(&config.model_path)?;
        Self::with_network(config, Box::new(network))
    }

    #[cfg(not(feature = "onnx"))]
    pub fn from_config(config: &SoftwareConfig) -> Result<Self, VisionError> {
        Err(VisionError::Model(format!(
            "cannot load {:?}: spotter-eye was built without the `onnx` feature",
            config.model_path
        )))
    }

    /// Build from configuration around an already constructed network
    pub fn with_network(
        config: &SoftwareConfig,
        network: Box<dyn ForwardPass>,
    ) -> Result<Self, VisionError> {
        let labels = load_labels(&config.labels_path)?;
        info!(
            "Software pipeline ready: {} classes, input {}",
            labels.len(),
            config.input_size
        );
        Ok(Self::new(network, labels, SoftwareSettings::from(config)))
    }

    pub fn settings(&self) -> &SoftwareSettings {
        &self.settings
    }

    pub fn load(&self, path: &Path) -> Result<Loaded, VisionError> {
        let image = image::open(path)?.to_rgb8();
        debug!("Loaded {:?} ({}x{})", path, image.width(), image.height());
        Ok(Loaded {
            image,
            source: Some(path.to_path_buf()),
        })
    }

    pub fn load_image(&self, image: RgbImage) -> Loaded {
        Loaded { image, source: None }
    }

    pub fn forward(&mut self, loaded: Loaded) -> Result<Forwarded, VisionError> {
        let blob = tensor::image_to_blob(&loaded.image, self.settings.input_size)?;
        let outputs = self.network.forward(&blob)?;
        debug!("Forward pass produced {} output layers", outputs.len());
        Ok(Forwarded { loaded, outputs })
    }

    /// Extraction followed by non-maximum suppression
    pub fn detect(&self, forwarded: Forwarded) -> Result<Detected, VisionError> {
        let (width, height) = forwarded.loaded.dimensions();
        let raw = extract_detections(
            &forwarded.outputs,
            width,
            height,
            self.settings.confidence_threshold,
        )?;
        let kept = nms::suppress(
            &raw.boxes,
            &raw.confidences,
            self.settings.nms_iou_threshold,
            self.settings.nms_score_threshold,
        )?;

        let detections: Vec<Detection> = kept
            .into_iter()
            .map(|i| Detection {
                class_id: raw.class_ids[i],
                label: self.label(raw.class_ids[i]),
                confidence: raw.confidences[i],
                bbox: raw.boxes[i],
            })
            .collect();
        debug!(
            "{} candidates, {} after suppression",
            raw.len(),
            detections.len()
        );

        Ok(Detected {
            loaded: forwarded.loaded,
            detections,
        })
    }

    pub fn annotate(&self, detected: Detected) -> Drawn {
        let Detected { loaded, detections } = detected;
        let mut image = loaded.image;
        for detection in &detections {
            draw_annotation(&mut image, detection, &self.palette);
        }
        Drawn {
            image,
            detections,
            source: loaded.source,
        }
    }

    fn label(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

fn draw_annotation(image: &mut RgbImage, detection: &Detection, palette: &Palette) {
    let text = annotate::caption(&detection.label, detection.confidence);
    annotate::draw_detection(image, &detection.bbox, palette.color(detection.class_id), &text);
}
