pub mod decode;
pub mod discovery;
pub mod ffmpeg;
pub mod gstreamer;
pub mod session;
pub mod source;
pub mod v4l2;

pub use decode::{is_gray_frame, PixelFormat, RawFrame};
pub use discovery::{
    test_device_open, CameraDevice, CameraEnvironment, DeviceLocator, DeviceProbe, DiscoverySource,
    HostProbe, SystemProbe,
};
pub use session::{CaptureSession, FrameSample, SessionState};
pub use source::{CaptureTuning, FrameSource};
pub use v4l2::V4lSource;
