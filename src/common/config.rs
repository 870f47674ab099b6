use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::common::error::{FaceAuthError, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    pub video: VideoConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CoreConfig {
    /// Use the heavier CNN detector (more accurate, slower).
    #[serde(default)]
    pub use_cnn: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoConfig {
    pub device_path: PathBuf,
    #[serde(default)]
    pub device_backend: DeviceBackend,
    #[serde(default)]
    pub recording_plugin: RecordingPlugin,
    /// 0 leaves the driver default in place.
    #[serde(default)]
    pub device_fps: u32,
    /// -1 leaves the driver default in place.
    #[serde(default = "default_unset_dimension")]
    pub frame_width: i32,
    #[serde(default = "default_unset_dimension")]
    pub frame_height: i32,
    #[serde(default)]
    pub force_mjpeg: bool,
    #[serde(default = "default_dark_threshold")]
    pub dark_threshold: f64,
    #[serde(default = "default_true")]
    pub warn_no_device: bool,
}

fn default_unset_dimension() -> i32 { -1 }
fn default_dark_threshold() -> f64 { 60.0 }
fn default_true() -> bool { true }

/// Transport used to talk to the camera when the native recorder is active.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    #[default]
    V4l2,
    Gstreamer,
    Any,
}

impl DeviceBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceBackend::V4l2 => "v4l2",
            DeviceBackend::Gstreamer => "gstreamer",
            DeviceBackend::Any => "any",
        }
    }
}

/// Frame provider selected with `video.recording_plugin`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingPlugin {
    #[default]
    #[serde(alias = "opencv")]
    Native,
    Ffmpeg,
    #[serde(alias = "pyv4l2")]
    Direct,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    /// Overrides the run-mode models directory when set.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_detector_model")]
    pub detector: PathBuf,
    #[serde(default = "default_cnn_detector_model")]
    pub detector_cnn: PathBuf,
    #[serde(default = "default_landmark_model")]
    pub landmarks: PathBuf,
    #[serde(default = "default_encoder_model")]
    pub encoder: PathBuf,
}

fn default_detector_model() -> PathBuf { PathBuf::from("face_detector.onnx") }
fn default_cnn_detector_model() -> PathBuf { PathBuf::from("face_detector_cnn.onnx") }
fn default_landmark_model() -> PathBuf { PathBuf::from("face_landmarks_5.onnx") }
fn default_encoder_model() -> PathBuf { PathBuf::from("face_encoder.onnx") }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            directory: None,
            detector: default_detector_model(),
            detector_cnn: default_cnn_detector_model(),
            landmarks: default_landmark_model(),
            encoder: default_encoder_model(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
    #[serde(default = "default_landmark_input")]
    pub landmark_input_size: u32,
    #[serde(default = "default_encoder_input")]
    pub encoder_input_size: u32,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }
fn default_nms_iou() -> f32 { 0.45 }
fn default_landmark_input() -> u32 { 112 }
fn default_encoder_input() -> u32 { 150 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            detection_confidence: default_detection_confidence(),
            nms_iou: default_nms_iou(),
            landmark_input_size: default_landmark_input(),
            encoder_input_size: default_encoder_input(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    #[serde(default = "default_max_frames")]
    pub max_frames: u32,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_upsample")]
    pub upsample: u32,
    #[serde(default = "default_jitters")]
    pub jitters: u32,
}

fn default_max_frames() -> u32 { 60 }
fn default_settle_delay() -> u64 { 2000 }
fn default_upsample() -> u32 { 1 }
fn default_jitters() -> u32 { 1 }

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            max_frames: default_max_frames(),
            settle_delay_ms: default_settle_delay(),
            upsample: default_upsample(),
            jitters: default_jitters(),
        }
    }
}

/// Capture settings frozen when a session is constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub device_path: PathBuf,
    pub backend: DeviceBackend,
    pub plugin: RecordingPlugin,
    pub fps: Option<u32>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub force_mjpeg: bool,
    pub dark_threshold: f64,
    pub warn_no_device: bool,
}

impl CaptureConfig {
    pub fn for_device(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            backend: DeviceBackend::default(),
            plugin: RecordingPlugin::default(),
            fps: None,
            frame_width: None,
            frame_height: None,
            force_mjpeg: false,
            dark_threshold: default_dark_threshold(),
            warn_no_device: true,
        }
    }
}

impl From<&VideoConfig> for CaptureConfig {
    fn from(video: &VideoConfig) -> Self {
        let dimension = |value: i32| u32::try_from(value).ok().filter(|v| *v > 0);
        Self {
            device_path: video.device_path.clone(),
            backend: video.device_backend,
            plugin: video.recording_plugin,
            fps: Some(video.device_fps).filter(|fps| *fps != 0),
            frame_width: dimension(video.frame_width),
            frame_height: dimension(video.frame_height),
            force_mjpeg: video.force_mjpeg,
            dark_threshold: video.dark_threshold,
            warn_no_device: video.warn_no_device,
        }
    }
}

impl EnrollmentConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceAuthError::Config(format!(
                "Config file not found: {}. Please create it from the example.",
                path.display()
            )));
        }

        tracing::debug!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| FaceAuthError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig::from(&self.video)
    }

    pub fn validate(&self) -> Result<()> {
        if self.video.device_path.as_os_str().is_empty() {
            return Err(FaceAuthError::Config("video.device_path must be set".into()));
        }

        if !(0.0..=100.0).contains(&self.video.dark_threshold) {
            return Err(FaceAuthError::Config(format!(
                "Dark threshold must be between 0 and 100, got {}",
                self.video.dark_threshold
            )));
        }

        let sizes = [
            ("frame_width", self.video.frame_width),
            ("frame_height", self.video.frame_height),
        ];
        for (name, value) in sizes {
            if value != -1 && !(1..=4096).contains(&value) {
                return Err(FaceAuthError::Config(format!(
                    "video.{} must be -1 or between 1 and 4096, got {}", name, value
                )));
            }
        }

        if self.detector.detection_confidence < 0.0 || self.detector.detection_confidence > 1.0 {
            return Err(FaceAuthError::Config(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.detection_confidence
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_width > 4096
            || self.detector.input_height == 0 || self.detector.input_height > 4096
        {
            return Err(FaceAuthError::Config(format!(
                "Detector input must be between 1 and 4096, got {}x{}",
                self.detector.input_width, self.detector.input_height
            )));
        }

        if self.detector.landmark_input_size == 0 || self.detector.encoder_input_size == 0 {
            return Err(FaceAuthError::Config(
                "Landmark and encoder input sizes must be non-zero".into(),
            ));
        }

        if self.enrollment.max_frames == 0 {
            return Err(FaceAuthError::Config("enrollment.max_frames must be at least 1".into()));
        }

        Ok(())
    }
}
