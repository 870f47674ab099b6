use crate::camera::decode::{PixelFormat, RawFrame};
use crate::camera::source::{CaptureTuning, FrameSource};
use crate::camera::v4l2::V4lSource;
use anyhow::Context;
use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

/// Frame source that pipes raw RGB24 frames out of an `ffmpeg` child process.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl FfmpegSource {
    pub fn open(path: &Path, tuning: &CaptureTuning) -> anyhow::Result<Self> {
        let (width, height) = match (tuning.width, tuning.height) {
            (Some(width), Some(height)) => (width, height),
            (width, height) => {
                // rawvideo output has no framing, so the size must be known up front
                let (device_width, device_height, _) = V4lSource::query_format(path)
                    .context("probe frame size for ffmpeg")?;
                (width.unwrap_or(device_width), height.unwrap_or(device_height))
            }
        };

        let args = ffmpeg_args(path, tuning, width, height);
        tracing::debug!("Spawning ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("spawn ffmpeg")?;
        let stdout = child.stdout.take().context("ffmpeg stdout not captured")?;

        Ok(Self { child, stdout, width, height })
    }
}

pub fn ffmpeg_args(path: &Path, tuning: &CaptureTuning, width: u32, height: u32) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-f", "v4l2"]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
    if tuning.fourcc == Some(PixelFormat::Mjpeg) {
        args.extend(["-input_format".into(), "mjpeg".into()]);
    }
    if let Some(fps) = tuning.fps {
        args.extend(["-framerate".into(), fps.to_string()]);
    }
    args.extend([
        "-video_size".into(),
        format!("{}x{}", width, height),
        "-i".into(),
        path.display().to_string(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-".into(),
    ]);
    args
}

impl FrameSource for FfmpegSource {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn read(&mut self) -> anyhow::Result<RawFrame> {
        let mut data = vec![0u8; (self.width * self.height * 3) as usize];
        self.stdout
            .read_exact(&mut data)
            .context("ffmpeg stream ended")?;
        Ok(RawFrame::new(PixelFormat::Rgb24, self.width, self.height, data))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
