use crate::camera::decode::{PixelFormat, RawFrame};
use crate::camera::source::{CaptureTuning, FrameSource};
use anyhow::{anyhow, Context};
use ouroboros::self_referencing;
use std::path::{Path, PathBuf};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// Frame source reading a V4L2 device through memory-mapped buffers.
pub struct V4lSource {
    path: PathBuf,
    state: V4lState,
    format: PixelFormat,
    width: u32,
    height: u32,
}

#[self_referencing]
struct V4lState {
    device: Device,
    #[borrows(device)]
    #[covariant]
    stream: v4l::io::mmap::Stream<'this>,
}

impl V4lSource {
    pub fn open(path: &Path, tuning: &CaptureTuning) -> anyhow::Result<Self> {
        tracing::debug!("Opening camera device {}...", path.display());

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open camera {}", path.display()))?;

        let caps = device.query_caps().context("Failed to query capabilities")?;
        // Some IR devices report only metadata capture but still stream video
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            tracing::warn!(
                "Device {} may not support standard video capture ({:?})",
                path.display(),
                caps.capabilities
            );
        }

        let format = apply_tuning(&device, path, tuning)?;
        let pixel_format = PixelFormat::from_fourcc(format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "Unsupported pixel format {} on {}",
                format.fourcc.str().unwrap_or("UNKNOWN"),
                path.display()
            )
        })?;

        let state = V4lStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::io::mmap::Stream::with_buffers(device, Type::VideoCapture, 4)
                    .context("Failed to create stream")
            },
        }
        .try_build()?;

        tracing::info!(
            "Camera {} streaming {}x{} {:?}",
            path.display(),
            format.width,
            format.height,
            pixel_format
        );

        Ok(Self {
            path: path.to_path_buf(),
            state,
            format: pixel_format,
            width: format.width,
            height: format.height,
        })
    }

    /// Current negotiated format of a device, without streaming from it.
    pub fn query_format(path: &Path) -> anyhow::Result<(u32, u32, [u8; 4])> {
        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open camera {}", path.display()))?;
        let format = device.format().context("Failed to get format")?;
        Ok((format.width, format.height, format.fourcc.repr))
    }
}

/// Best-effort: a setting the driver rejects is logged and skipped.
fn apply_tuning(
    device: &Device,
    path: &Path,
    tuning: &CaptureTuning,
) -> anyhow::Result<v4l::Format> {
    let mut fmt = device.format().context("Failed to get format")?;
    tracing::debug!(
        "Current format: {}x{} {}",
        fmt.width,
        fmt.height,
        fmt.fourcc.str().unwrap_or("UNKNOWN")
    );

    if tuning.fourcc.is_some() || tuning.width.is_some() || tuning.height.is_some() {
        if let Some(fourcc) = tuning.fourcc {
            fmt.fourcc = FourCC::new(&fourcc.fourcc());
        }
        if let Some(width) = tuning.width {
            fmt.width = width;
        }
        if let Some(height) = tuning.height {
            fmt.height = height;
        }

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!(
                "Could not set format on {}: {}. Using device defaults.",
                path.display(),
                e
            );
        }
    }

    if let Some(fps) = tuning.fps {
        let params = v4l::video::capture::Parameters::with_fps(fps);
        if let Err(e) = device.set_params(&params) {
            tracing::warn!("Could not set {} fps on {}: {}", fps, path.display(), e);
        }
    }

    let final_fmt = device.format().context("Failed to get final format")?;
    if let (Some(width), Some(height)) = (tuning.width, tuning.height) {
        if final_fmt.width != width || final_fmt.height != height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                final_fmt.width, final_fmt.height, width, height
            );
        }
    }
    Ok(final_fmt)
}

impl FrameSource for V4lSource {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn read(&mut self) -> anyhow::Result<RawFrame> {
        let data = self
            .state
            .with_stream_mut(|stream| {
                stream.next().map(|(buf, meta)| {
                    // Compressed frames only fill part of the buffer
                    let used = (meta.bytesused as usize).min(buf.len());
                    if used == 0 { buf.to_vec() } else { buf[..used].to_vec() }
                })
            })
            .with_context(|| format!("Failed to capture from {}", self.path.display()))?;

        Ok(RawFrame::new(self.format, self.width, self.height, data))
    }
}
