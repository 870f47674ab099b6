pub mod config;
pub mod error;
pub mod paths;

pub use config::{CaptureConfig, Config, DeviceBackend, RecordingPlugin};
pub use error::{FaceAuthError, Result, EXIT_DEVICE_ERROR, EXIT_FAILURE};
pub use paths::Paths;
