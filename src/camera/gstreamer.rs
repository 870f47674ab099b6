//! GStreamer frame source (`v4l2src ! videoconvert ! appsink`).
//!
//! Built only with the `gstreamer` feature; without it opening always fails,
//! which the session reports like any other backend-open failure.

use crate::camera::source::{CaptureTuning, FrameSource};
use std::path::Path;

#[cfg(feature = "gstreamer")]
pub use enabled::GstreamerSource;

pub fn is_available() -> bool {
    cfg!(feature = "gstreamer")
}

pub fn open(path: &Path, tuning: &CaptureTuning) -> anyhow::Result<Box<dyn FrameSource>> {
    #[cfg(feature = "gstreamer")]
    {
        Ok(Box::new(enabled::GstreamerSource::open(path, tuning)?))
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        let _ = tuning;
        anyhow::bail!("GStreamer capture of {} requires the gstreamer feature", path.display())
    }
}

/// Source caps segment placed between `v4l2src` and `videoconvert`.
pub fn source_caps(tuning: &CaptureTuning) -> Option<String> {
    if tuning.is_default() {
        return None;
    }

    let mjpeg = tuning.fourcc.is_some();
    let mut caps = String::from(if mjpeg { "image/jpeg" } else { "video/x-raw" });
    if let Some(width) = tuning.width {
        caps.push_str(&format!(",width={}", width));
    }
    if let Some(height) = tuning.height {
        caps.push_str(&format!(",height={}", height));
    }
    if let Some(fps) = tuning.fps {
        caps.push_str(&format!(",framerate={}/1", fps));
    }
    if mjpeg {
        caps.push_str(" ! jpegdec");
    }
    Some(caps)
}

pub fn pipeline_description(path: &Path, tuning: &CaptureTuning) -> String {
    let caps = source_caps(tuning)
        .map(|caps| format!(" ! {}", caps))
        .unwrap_or_default();
    format!(
        "v4l2src device={}{} ! videoconvert ! video/x-raw,format=RGB ! \
         appsink name=appsink sync=false max-buffers=1 drop=true",
        path.display(),
        caps
    )
}

#[cfg(feature = "gstreamer")]
mod enabled {
    use super::pipeline_description;
    use crate::camera::decode::{PixelFormat, RawFrame};
    use crate::camera::source::{CaptureTuning, FrameSource};
    use anyhow::Context;
    use gstreamer::prelude::*;
    use std::path::Path;

    pub struct GstreamerSource {
        pipeline: gstreamer::Pipeline,
        appsink: gstreamer_app::AppSink,
    }

    impl GstreamerSource {
        pub fn open(path: &Path, tuning: &CaptureTuning) -> anyhow::Result<Self> {
            gstreamer::init().context("initialize gstreamer")?;

            let description = pipeline_description(path, tuning);
            tracing::debug!("GStreamer pipeline: {}", description);

            let pipeline = gstreamer::parse::launch(&description)
                .context("build capture pipeline")?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| anyhow::anyhow!("capture pipeline is not a Pipeline"))?;

            let appsink = pipeline
                .by_name("appsink")
                .context("appsink element missing from pipeline")?
                .downcast::<gstreamer_app::AppSink>()
                .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

            pipeline
                .set_state(gstreamer::State::Playing)
                .context("set capture pipeline to Playing")?;

            // Live sources report open failures while prerolling
            let (result, _, _) = pipeline.state(gstreamer::ClockTime::from_seconds(5));
            if let Err(e) = result {
                let _ = pipeline.set_state(gstreamer::State::Null);
                anyhow::bail!("capture pipeline for {} failed to start: {:?}", path.display(), e);
            }

            Ok(Self { pipeline, appsink })
        }
    }

    impl FrameSource for GstreamerSource {
        fn name(&self) -> &'static str {
            "gstreamer"
        }

        fn read(&mut self) -> anyhow::Result<RawFrame> {
            let sample = self
                .appsink
                .try_pull_sample(gstreamer::ClockTime::from_seconds(5))
                .context("camera stream stalled")?;

            let buffer = sample.buffer().context("sample missing buffer")?;
            let caps = sample.caps().context("sample missing caps")?;
            let info = gstreamer_video::VideoInfo::from_caps(caps)
                .context("parse caps as video info")?;

            let width = info.width();
            let height = info.height();
            let row_bytes = (width as usize) * 3;
            let stride = info.stride()[0] as usize;

            let map = buffer.map_readable().context("map sample buffer")?;
            let data = map.as_slice();

            let pixels = if stride == row_bytes {
                data.get(..row_bytes * height as usize)
                    .context("sample buffer is shorter than its caps")?
                    .to_vec()
            } else {
                let mut pixels = Vec::with_capacity(row_bytes * height as usize);
                for row in 0..height as usize {
                    let start = row * stride;
                    pixels.extend_from_slice(
                        data.get(start..start + row_bytes)
                            .context("sample buffer row is out of bounds")?,
                    );
                }
                pixels
            };

            Ok(RawFrame::new(PixelFormat::Rgb24, width, height, pixels))
        }
    }

    impl Drop for GstreamerSource {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::decode::PixelFormat;

    #[test]
    fn untuned_pipeline_has_no_source_caps() {
        let description = pipeline_description(Path::new("/dev/video0"), &CaptureTuning::default());
        assert!(description.starts_with("v4l2src device=/dev/video0 ! videoconvert"));
    }

    #[test]
    fn forced_mjpeg_adds_decoder() {
        let tuning = CaptureTuning {
            fourcc: Some(PixelFormat::Mjpeg),
            fps: Some(30),
            width: Some(640),
            height: None,
        };
        assert_eq!(
            source_caps(&tuning).as_deref(),
            Some("image/jpeg,width=640,framerate=30/1 ! jpegdec")
        );
    }
}
