use std::path::PathBuf;
use thiserror::Error;

/// Process status for camera failures (missing device, failed open, failed read).
pub const EXIT_DEVICE_ERROR: i32 = 14;
/// Process status for every other enrollment failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Error, Debug)]
pub enum FaceAuthError {
    #[error("Camera device not found at: {}", .0.display())]
    DeviceNotFound(PathBuf),

    #[error("Could not open camera {} with any backend ({attempts})", .device.display())]
    BackendOpenFailed { device: PathBuf, attempts: String },

    #[error(
        "Failed to read frame from camera at: {} (backend: {backend}): {reason}",
        .device.display()
    )]
    FrameRead {
        device: PathBuf,
        backend: String,
        reason: String,
    },

    #[error("Could not decode camera frame: {0}")]
    FrameDecode(String),

    #[error("Camera saw only black frames - is the IR emitter working?")]
    NoValidFrames,

    #[error(
        "All frames were too dark (average darkness {average:.1}, threshold {threshold:.1}), \
         please check dark_threshold in config"
    )]
    AllFramesTooDark { average: f64, threshold: f64 },

    #[error("No face detected, aborting")]
    NoFaceDetected,

    #[error("Multiple faces detected ({0}), aborting")]
    AmbiguousFace(usize),

    #[error(
        "Recognition model files are missing from {}: {}",
        .directory.display(),
        list_paths(.missing)
    )]
    ModelFilesMissing {
        directory: PathBuf,
        missing: Vec<PathBuf>,
    },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid user name: {0:?}")]
    InvalidUser(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl FaceAuthError {
    /// Status the CLI exits with when this error ends a command.
    pub fn exit_code(&self) -> i32 {
        match self {
            FaceAuthError::DeviceNotFound(_)
            | FaceAuthError::BackendOpenFailed { .. }
            | FaceAuthError::FrameRead { .. } => EXIT_DEVICE_ERROR,
            _ => EXIT_FAILURE,
        }
    }
}

fn list_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, FaceAuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_failures_map_to_device_status() {
        assert_eq!(FaceAuthError::DeviceNotFound("/dev/video9".into()).exit_code(), 14);
        let read = FaceAuthError::FrameRead {
            device: "/dev/video0".into(),
            backend: "v4l2".into(),
            reason: "device busy".into(),
        };
        assert_eq!(read.exit_code(), 14);
        assert!(read.to_string().contains("/dev/video0"));
        assert!(read.to_string().contains("v4l2"));
    }

    #[test]
    fn enrollment_failures_map_to_generic_status() {
        assert_eq!(FaceAuthError::NoFaceDetected.exit_code(), 1);
        assert_eq!(FaceAuthError::AmbiguousFace(2).exit_code(), 1);
        assert_eq!(FaceAuthError::NoValidFrames.exit_code(), 1);
    }
}
