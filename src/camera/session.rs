use crate::camera::decode::{to_grayscale, GrayscaleError};
use crate::camera::discovery::{CameraDevice, CameraEnvironment, DeviceLocator};
use crate::camera::ffmpeg::FfmpegSource;
use crate::camera::gstreamer;
use crate::camera::source::{CaptureTuning, FrameSource};
use crate::camera::v4l2::V4lSource;
use crate::common::{CaptureConfig, DeviceBackend, FaceAuthError, RecordingPlugin, Result};
use image::DynamicImage;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Opening,
    Ready,
    Closed,
}

/// One decoded frame and its grayscale derivative.
///
/// When grayscale conversion is not possible (single-channel input) `gray`
/// holds a copy of `color`.
pub struct FrameSample {
    pub color: DynamicImage,
    pub gray: DynamicImage,
}

/// Exclusive owner of one open camera.
///
/// The device is released by `release()` or on drop, whichever comes first.
pub struct CaptureSession {
    config: CaptureConfig,
    source: Option<Box<dyn FrameSource>>,
    backend_name: &'static str,
    state: SessionState,
    frames_read: usize,
}

impl CaptureSession {
    pub fn open(config: CaptureConfig) -> Result<Self> {
        Self::open_with_locator(config, &DeviceLocator::host())
    }

    /// Like `open`, with the locator used for missing-device diagnostics.
    pub fn open_with_locator(config: CaptureConfig, locator: &DeviceLocator) -> Result<Self> {
        if !config.device_path.exists() {
            if config.warn_no_device {
                report_missing_device(&config.device_path, locator);
            }
            return Err(FaceAuthError::DeviceNotFound(config.device_path.clone()));
        }

        let mut session = Self::unopened(config);
        session.connect()?;
        Ok(session)
    }

    /// Session over an already constructed source.
    pub fn from_source(config: CaptureConfig, source: Box<dyn FrameSource>) -> Result<Self> {
        let mut session = Self::unopened(config);
        session.state = SessionState::Opening;
        session.attach(source);
        Ok(session)
    }

    fn unopened(config: CaptureConfig) -> Self {
        Self {
            config,
            source: None,
            backend_name: "none",
            state: SessionState::Unopened,
            frames_read: 0,
        }
    }

    /// Resolves and attaches the configured backend. A failed open leaves the
    /// session `Closed`.
    fn connect(&mut self) -> Result<()> {
        self.state = SessionState::Opening;
        match resolve_source(&self.config) {
            Ok(source) => {
                self.attach(source);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    fn attach(&mut self, mut source: Box<dyn FrameSource>) {
        // The first frame only wakes the device up
        if let Err(e) = source.grab() {
            let device = self.config.device_path.display();
            tracing::debug!("Wake-up grab on {} failed: {:#}", device, e);
        }

        self.backend_name = source.name();
        self.source = Some(source);
        self.state = SessionState::Ready;
        tracing::debug!(
            "Capture session ready on {} ({})",
            self.config.device_path.display(),
            self.backend_name
        );
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn frames_read(&self) -> usize {
        self.frames_read
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Blocking read of one frame. Read failures are not retried.
    pub fn read_frame(&mut self) -> Result<FrameSample> {
        let source = self.source.as_mut().ok_or_else(|| FaceAuthError::FrameRead {
            device: self.config.device_path.clone(),
            backend: self.config.backend.as_str().to_string(),
            reason: "capture session is not open".to_string(),
        })?;

        let raw = source.read().map_err(|e| FaceAuthError::FrameRead {
            device: self.config.device_path.clone(),
            backend: self.config.backend.as_str().to_string(),
            reason: format!("{:#}", e),
        })?;
        self.frames_read += 1;

        let color = raw.decode()?;
        let gray = match to_grayscale(&color) {
            Ok(gray) => DynamicImage::ImageLuma8(gray),
            Err(GrayscaleError::SingleChannel) => color.clone(),
            Err(GrayscaleError::Unsupported(color_type)) => {
                return Err(FaceAuthError::FrameDecode(format!(
                    "cannot convert {:?} frame to grayscale",
                    color_type
                )));
            }
        };

        Ok(FrameSample { color, gray })
    }

    /// Releases the device. Safe to call any number of times.
    pub fn release(&mut self) {
        if let Some(source) = self.source.take() {
            tracing::debug!("Releasing camera {}", self.config.device_path.display());
            drop(source);
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.release();
    }
}

fn resolve_source(config: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
    let tuning = CaptureTuning::from(config);
    let path = config.device_path.as_path();

    let opened = match config.plugin {
        RecordingPlugin::Ffmpeg => FfmpegSource::open(path, &tuning)
            .map(|source| Box::new(source) as Box<dyn FrameSource>)
            .map_err(|e| vec![format!("ffmpeg: {:#}", e)]),
        RecordingPlugin::Direct => V4lSource::open(path, &tuning)
            .map(|source| Box::new(source) as Box<dyn FrameSource>)
            .map_err(|e| vec![format!("v4l2: {:#}", e)]),
        RecordingPlugin::Native => open_native(path, config.backend, &tuning),
    };

    opened.map_err(|attempts| FaceAuthError::BackendOpenFailed {
        device: config.device_path.clone(),
        attempts: attempts.join("; "),
    })
}

/// Opens the configured backend; a failed `v4l2` open gets one GStreamer retry.
fn open_native(
    path: &Path,
    backend: DeviceBackend,
    tuning: &CaptureTuning,
) -> std::result::Result<Box<dyn FrameSource>, Vec<String>> {
    match open_backend(path, backend, tuning) {
        Ok(source) => Ok(source),
        Err(e) if backend == DeviceBackend::V4l2 => {
            tracing::warn!(
                "V4L2 could not open {}: {:#}. Retrying with GStreamer.",
                path.display(),
                e
            );
            gstreamer::open(path, tuning).map_err(|fallback| {
                vec![format!("v4l2: {:#}", e), format!("gstreamer: {:#}", fallback)]
            })
        }
        Err(e) => Err(vec![format!("{}: {:#}", backend.as_str(), e)]),
    }
}

/// Opens one backend with no fallback.
pub(crate) fn open_backend(
    path: &Path,
    backend: DeviceBackend,
    tuning: &CaptureTuning,
) -> anyhow::Result<Box<dyn FrameSource>> {
    match backend {
        DeviceBackend::V4l2 | DeviceBackend::Any => Ok(Box::new(V4lSource::open(path, tuning)?)),
        DeviceBackend::Gstreamer => gstreamer::open(path, tuning),
    }
}

fn report_missing_device(path: &Path, locator: &DeviceLocator) {
    let environment = locator.detect_environment();
    let available = locator.discover_devices();
    for line in missing_device_report(path, &environment, &available) {
        println!("{}", line);
    }
}

fn missing_device_report(
    path: &Path,
    environment: &CameraEnvironment,
    available: &[CameraDevice],
) -> Vec<String> {
    let mut lines = vec![format!("Could not find a camera device at: {}", path.display())];

    if available.is_empty() {
        lines.push("No camera devices were detected on this system.".to_string());
    } else {
        lines.push("Available camera devices on this system:".to_string());
        for device in available {
            lines.push(format!("  {}  ({})", device.path.display(), device.display_name));
        }
    }
    if environment.pipewire_running {
        let hint = if environment.alternate_backend_available {
            "Try setting device_backend = gstreamer in the config."
        } else {
            "Rebuild faceprint with the gstreamer feature to capture through GStreamer."
        };
        lines.push(format!("Note: PipeWire is running. {}", hint));
    }
    lines.push("Please edit the 'device_path' config value.".to_string());
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::decode::{PixelFormat, RawFrame};
    use crate::camera::discovery::DiscoverySource;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingSource {
        reads: Rc<Cell<usize>>,
        fail_after: usize,
    }

    impl FrameSource for CountingSource {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn read(&mut self) -> anyhow::Result<RawFrame> {
            let n = self.reads.get();
            self.reads.set(n + 1);
            if n >= self.fail_after {
                anyhow::bail!("device disconnected");
            }
            Ok(RawFrame::new(PixelFormat::Grey, 4, 4, vec![90; 16]))
        }
    }

    fn session(fail_after: usize) -> (CaptureSession, Rc<Cell<usize>>) {
        let reads = Rc::new(Cell::new(0));
        let source = CountingSource { reads: reads.clone(), fail_after };
        let config = CaptureConfig::for_device("/dev/video0");
        let session = CaptureSession::from_source(config, Box::new(source)).unwrap();
        (session, reads)
    }

    #[test]
    fn opening_grabs_one_wake_up_frame() {
        let (session, reads) = session(usize::MAX);
        assert_eq!(reads.get(), 1);
        assert_eq!(session.frames_read(), 0);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.backend_name(), "counting");
    }

    #[test]
    fn single_channel_frame_doubles_as_grayscale() {
        let (mut session, _) = session(usize::MAX);
        let sample = session.read_frame().unwrap();
        assert_eq!(sample.color, sample.gray);
        assert_eq!(session.frames_read(), 1);
    }

    #[test]
    fn read_failure_names_device_and_backend() {
        let (mut session, _) = session(1);
        let err = session.read_frame().err().unwrap();
        assert_eq!(err.exit_code(), 14);
        let message = err.to_string();
        assert!(message.contains("/dev/video0"));
        assert!(message.contains("v4l2"));
    }

    #[test]
    fn release_is_idempotent() {
        let (mut session, _) = session(usize::MAX);
        session.release();
        session.release();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.read_frame().is_err());
    }

    #[test]
    fn missing_device_is_reported_without_opening() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CaptureConfig::for_device(dir.path().join("video9"));
        config.warn_no_device = false;
        let host = crate::camera::discovery::HostProbe::default();
        let locator = DeviceLocator::new(dir.path(), Box::new(host));

        let err = CaptureSession::open_with_locator(config, &locator).err().unwrap();
        assert!(matches!(err, FaceAuthError::DeviceNotFound(_)));
        assert_eq!(err.exit_code(), 14);
    }

    #[cfg(not(feature = "gstreamer"))]
    fn non_device_file() -> (tempfile::TempDir, CaptureConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video0");
        std::fs::write(&path, b"").unwrap();
        let mut config = CaptureConfig::for_device(path);
        config.warn_no_device = false;
        (dir, config)
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn failed_v4l2_open_retries_gstreamer_exactly_once() {
        let (_dir, config) = non_device_file();
        let mut session = CaptureSession::unopened(config.clone());

        let err = session.connect().unwrap_err();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(err.exit_code(), 14);
        match err {
            FaceAuthError::BackendOpenFailed { attempts, .. } => {
                let hops: Vec<&str> = attempts.split("; ").collect();
                assert_eq!(hops.len(), 2, "{}", attempts);
                assert!(hops[0].starts_with("v4l2: "), "{}", attempts);
                assert!(hops[1].starts_with("gstreamer: "), "{}", attempts);
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(matches!(
            CaptureSession::open(config).err().unwrap(),
            FaceAuthError::BackendOpenFailed { .. }
        ));
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn other_backends_are_tried_once_without_fallback() {
        let single = [(DeviceBackend::Any, "any: "), (DeviceBackend::Gstreamer, "gstreamer: ")];
        for (backend, name) in single {
            let (_dir, mut config) = non_device_file();
            config.backend = backend;
            let mut session = CaptureSession::unopened(config);

            match session.connect().unwrap_err() {
                FaceAuthError::BackendOpenFailed { attempts, .. } => {
                    assert!(attempts.starts_with(name), "{}", attempts);
                    assert!(!attempts.contains("; "), "{}", attempts);
                }
                other => panic!("unexpected error: {}", other),
            }
            assert_eq!(session.state(), SessionState::Closed);
        }
    }

    fn pipewire_host(alternate_backend_available: bool) -> CameraEnvironment {
        CameraEnvironment {
            pipewire_running: true,
            alternate_backend_available,
            ..CameraEnvironment::default()
        }
    }

    #[test]
    fn gstreamer_hint_needs_a_usable_gstreamer_backend() {
        let path = Path::new("/dev/video9");
        let devices = vec![CameraDevice {
            path: "/dev/video0".into(),
            display_name: "Integrated Camera".to_string(),
            source: DiscoverySource::ByPath,
        }];

        let with_gstreamer = missing_device_report(path, &pipewire_host(true), &devices).join("\n");
        assert!(with_gstreamer.contains("device_backend = gstreamer"), "{}", with_gstreamer);
        assert!(with_gstreamer.contains("/dev/video0  (Integrated Camera)"));

        let without = missing_device_report(path, &pipewire_host(false), &[]).join("\n");
        assert!(!without.contains("device_backend = gstreamer"), "{}", without);
        assert!(without.contains("gstreamer feature"), "{}", without);
        assert!(without.contains("No camera devices were detected"));

        let quiet = missing_device_report(path, &CameraEnvironment::default(), &[]).join("\n");
        assert!(!quiet.contains("PipeWire"));
    }
}
