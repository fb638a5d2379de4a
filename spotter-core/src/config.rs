// Configuration for the spotter detection service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which inference pipeline drives the run loop. Fixed at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Full network on the general-purpose processor
    Software,
    /// First and last layer in software, middle layers on the accelerator
    Hybrid,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Software => "software",
            PipelineMode::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for PipelineMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "software" | "sw" => Ok(PipelineMode::Software),
            "hybrid" | "hw" => Ok(PipelineMode::Hybrid),
            other => Err(ConfigError::ParseError(format!("unknown pipeline mode '{}'", other))),
        }
    }
}

/// Application behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Console logging and time log file output
    pub dev_mode: bool,
    pub pipeline: PipelineMode,
    /// Seconds to wait between cycles; absent means continuous looping
    pub capture_interval_secs: Option<u64>,
    /// Iterate a directory of images instead of the camera
    pub static_images: bool,
    /// Persist raw frames and annotated detections to disk
    pub save_images: bool,
    /// Identification of the image location, sent with every detection
    pub location: String,
    /// Camera device index
    pub camera: u32,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            pipeline: PipelineMode::Software,
            capture_interval_secs: Some(5),
            static_images: false,
            save_images: true,
            location: "not defined".to_string(),
            camera: 0,
            log_level: "info".to_string(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub log_dir: PathBuf,
    pub timelog_dir: PathBuf,
    pub output_dir: PathBuf,
    pub raw_image_dir: PathBuf,
    pub input_image_dir: PathBuf,
    pub detection_image_dir: PathBuf,
    /// Extension (with dot) used for captured frames
    pub extension: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            timelog_dir: PathBuf::from("./output/timelogs"),
            output_dir: PathBuf::from("./output"),
            raw_image_dir: PathBuf::from("./output/raw"),
            input_image_dir: PathBuf::from("./input"),
            detection_image_dir: PathBuf::from("./output/detections"),
            extension: ".jpg".to_string(),
        }
    }
}

/// Message bus connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub topic_detection: String,
    pub topic_state: String,
    pub topic_lastwill: String,
    pub last_will_message: String,
    /// Publish detection messages retained
    pub retain: bool,
    /// Upper bound for a single packet; detections carry a base64 image
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: format!("spotter-{}", std::process::id()),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            topic_detection: "yolo/detection".to_string(),
            topic_state: "yolo/state".to_string(),
            topic_lastwill: "yolo/status".to_string(),
            last_will_message: "The people detection stopped surreptitiously".to_string(),
            retain: true,
            max_packet_size: 8 * 1024 * 1024,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Timed event log behaviour
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TimingConfig {
    /// Overrides the title derived from the pipeline mode
    pub title: Option<String>,
    /// Write rows to the csv sink; defaults to `app.dev_mode`
    pub file_write: Option<bool>,
    /// Log a line for every finished measurement
    pub report: bool,
}

/// External frame capture command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub program: String,
    /// Arguments; `{device}` and `{output}` are substituted per capture
    pub args: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: [
                "-hide_banner", "-loglevel", "error", "-f", "v4l2", "-i", "{device}",
                "-frames:v", "1", "-y", "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Software pipeline model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareConfig {
    pub model_path: PathBuf,
    /// One class name per line
    pub labels_path: PathBuf,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
    pub nms_score_threshold: f32,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("./models/yolov3.onnx"),
            labels_path: PathBuf::from("./models/coco.names"),
            input_size: 416,
            confidence_threshold: 0.3,
            nms_iou_threshold: 0.3,
            nms_score_threshold: 0.3,
        }
    }
}

/// Weights of a software convolution layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvLayerConfig {
    /// `.npy` weights in darknet order (out, in, kh, kw)
    pub weights_path: PathBuf,
    /// `.npy` bias, one value per output channel
    pub bias_path: PathBuf,
    pub stride: usize,
    pub padding: usize,
}

/// Hybrid pipeline (software + accelerator)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Shared library exposing the accelerator C ABI
    pub accelerator_library: PathBuf,
    /// Shared library exposing the detection renderer C ABI
    pub renderer_library: PathBuf,
    /// Layer shape description of the quantized network
    pub layers_path: PathBuf,
    /// Layer whose output the accelerator produces
    pub accelerator_output_layer: String,
    pub first_layer: ConvLayerConfig,
    pub last_layer: ConvLayerConfig,
    /// Class names used by the renderer
    pub names_path: PathBuf,
    /// Data directory handed to the renderer (fonts/labels)
    pub renderer_data_dir: PathBuf,
    pub input_size: u32,
}

impl Default for HybridConfig {
    fn default() -> Self {
        let params = PathBuf::from("./params");
        Self {
            accelerator_library: PathBuf::from("./lib/libspotter_accel.so"),
            renderer_library: PathBuf::from("./lib/libspotter_render.so"),
            layers_path: params.join("tinier-yolo-layers.json"),
            accelerator_output_layer: "conv7".to_string(),
            first_layer: ConvLayerConfig {
                weights_path: params.join("tinier-yolo-conv0-W.npy"),
                bias_path: params.join("tinier-yolo-conv0-bias.npy"),
                stride: 2,
                padding: 1,
            },
            last_layer: ConvLayerConfig {
                weights_path: params.join("tinier-yolo-conv8-W.npy"),
                bias_path: params.join("tinier-yolo-conv8-bias.npy"),
                stride: 1,
                padding: 0,
            },
            names_path: PathBuf::from("./darknet/data/voc.names"),
            renderer_data_dir: PathBuf::from("./darknet"),
            input_size: 416,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SpotterConfig {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub mqtt: MqttConfig,
    pub timing: TimingConfig,
    pub capture: CaptureConfig,
    pub software: SoftwareConfig,
    pub hybrid: HybridConfig,
}

impl SpotterConfig {
    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Load configuration from string (JSON, TOML or YAML)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        if let Ok(config) = serde_json::from_str::<SpotterConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = toml::from_str::<SpotterConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = serde_yaml::from_str::<SpotterConfig>(content) {
            return Ok(config);
        }

        Err(ConfigError::ParseError("Unknown format".to_string()))
    }

    /// Overlay `SPOTTER_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(address) = std::env::var("SPOTTER_MQTT_ADDRESS") {
            self.mqtt.address = address;
        }

        if let Ok(port) = std::env::var("SPOTTER_MQTT_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.mqtt.port = p;
            }
        }

        if let Ok(username) = std::env::var("SPOTTER_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }

        if let Ok(password) = std::env::var("SPOTTER_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }

        if let Ok(log_level) = std::env::var("SPOTTER_LOG_LEVEL") {
            self.app.log_level = log_level;
        }

        if let Ok(mode) = std::env::var("SPOTTER_PIPELINE") {
            if let Ok(mode) = mode.parse::<PipelineMode>() {
                self.app.pipeline = mode;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.address.trim().is_empty() {
            return Err(ConfigError::ValidationError("mqtt.address cannot be empty".to_string()));
        }

        if self.mqtt.port == 0 {
            return Err(ConfigError::ValidationError("mqtt.port cannot be 0".to_string()));
        }

        if self.mqtt.client_id.is_empty() || self.mqtt.client_id.starts_with(' ') {
            return Err(ConfigError::ValidationError(
                "mqtt.client_id cannot be empty or start with a space".to_string(),
            ));
        }

        for (name, topic) in [
            ("mqtt.topic_detection", &self.mqtt.topic_detection),
            ("mqtt.topic_state", &self.mqtt.topic_state),
            ("mqtt.topic_lastwill", &self.mqtt.topic_lastwill),
        ] {
            if topic.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{} cannot be empty", name)));
            }
        }

        if self.software.input_size == 0 || self.hybrid.input_size == 0 {
            return Err(ConfigError::ValidationError("input_size must be > 0".to_string()));
        }

        for (name, value) in [
            ("software.confidence_threshold", self.software.confidence_threshold),
            ("software.nms_iou_threshold", self.software.nms_iou_threshold),
            ("software.nms_score_threshold", self.software.nms_score_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if !self.paths.extension.starts_with('.') {
            return Err(ConfigError::ValidationError(
                "paths.extension must start with '.'".to_string(),
            ));
        }

        if self.app.pipeline == PipelineMode::Hybrid {
            if self.hybrid.first_layer.stride == 0 || self.hybrid.last_layer.stride == 0 {
                return Err(ConfigError::ValidationError(
                    "hybrid convolution stride must be > 0".to_string(),
                ));
            }
            if self.hybrid.accelerator_library.as_os_str().is_empty()
                || self.hybrid.renderer_library.as_os_str().is_empty()
            {
                return Err(ConfigError::ValidationError(
                    "hybrid mode requires accelerator_library and renderer_library".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Create every output directory the service writes into
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.paths.log_dir,
            &self.paths.output_dir,
            &self.paths.raw_image_dir,
            &self.paths.detection_image_dir,
            &self.paths.timelog_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Title of the timed event log
    pub fn timing_title(&self) -> String {
        self.timing
            .title
            .clone()
            .unwrap_or_else(|| format!("{}-detection", self.app.pipeline.as_str()))
    }

    /// Whether timing rows go to the csv sink
    pub fn timing_file_write(&self) -> bool {
        self.timing.file_write.unwrap_or(self.app.dev_mode)
    }

    /// Inter-cycle sleep; `None` loops continuously
    pub fn capture_interval(&self) -> Option<Duration> {
        self.app.capture_interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(e) => write!(f, "Validation error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Configuration(err.to_string())
    }
}
