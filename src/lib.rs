// Core modules
pub mod camera;
pub mod common;
pub mod core;
pub mod storage;

// Re-export commonly used types
pub use camera::{CaptureSession, DeviceLocator, FrameSource};
pub use common::{CaptureConfig, Config, FaceAuthError, Paths, Result};
pub use core::{
    create_backend, Enrollment, EnrollmentOptions, IlluminationGate, RecognitionBackend,
};
pub use storage::{ModelRecord, ModelStore};
