use crate::camera::decode::{PixelFormat, RawFrame};
use crate::common::CaptureConfig;

/// A live frame provider owned by a capture session.
///
/// Dropping the source releases the underlying device.
pub trait FrameSource {
    /// Short transport name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Blocking read of exactly one frame.
    fn read(&mut self) -> anyhow::Result<RawFrame>;

    /// Read and discard one frame.
    fn grab(&mut self) -> anyhow::Result<()> {
        self.read().map(|_| ())
    }
}

/// Settings applied to a device right after it is opened, only when set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureTuning {
    pub fourcc: Option<PixelFormat>,
    pub fps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl CaptureTuning {
    pub fn is_default(&self) -> bool {
        *self == CaptureTuning::default()
    }
}

impl From<&CaptureConfig> for CaptureTuning {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            fourcc: config.force_mjpeg.then_some(PixelFormat::Mjpeg),
            fps: config.fps,
            width: config.frame_width,
            height: config.frame_height,
        }
    }
}
