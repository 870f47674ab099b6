//! One enrollment run: pick id and label, acquire a frame with exactly one
//! face, encode it and append the result to the user's model store.

use crate::camera::CaptureSession;
use crate::common::{Config, FaceAuthError, Result};
use crate::core::backend::{FaceRectangle, RecognitionBackend};
use crate::core::illumination::{GateStats, IlluminationGate};
use crate::storage::{default_label, next_id, sanitize_label, ModelRecord, ModelStore};
use image::DynamicImage;
use std::io::{self, BufRead, Write};
use std::time::Duration;

/// Hard cap on frames read per run, whatever the config says.
pub const MAX_FRAMES: u32 = 60;

/// Asks the operator for a model label.
pub trait LabelPrompt {
    /// Returns the typed label, or `default` when nothing was typed.
    fn ask(&mut self, default: &str) -> Result<String>;
}

pub struct StdinPrompt;

impl LabelPrompt for StdinPrompt {
    fn ask(&mut self, default: &str) -> Result<String> {
        print!("Enter a label for this new model [{}]: ", default);
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let line = line.trim();
        Ok(if line.is_empty() { default.to_string() } else { line.to_string() })
    }
}

pub enum LabelChoice<'a> {
    Explicit(String),
    Interactive(&'a mut dyn LabelPrompt),
    /// Non-interactive runs take the generated label.
    Automatic,
}

pub fn resolve_label(choice: LabelChoice<'_>, id: u32) -> Result<String> {
    let default = default_label(id);
    let raw = match choice {
        LabelChoice::Explicit(label) => label,
        LabelChoice::Interactive(prompt) => prompt.ask(&default)?,
        LabelChoice::Automatic => default,
    };

    let (label, stripped) = sanitize_label(&raw);
    if stripped {
        println!("NOTICE: Removing illegal character \",\" from model label");
    }
    Ok(label)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentOptions {
    pub max_frames: u32,
    pub settle_delay: Duration,
    pub upsample: u32,
    pub jitters: u32,
}

impl Default for EnrollmentOptions {
    fn default() -> Self {
        Self {
            max_frames: MAX_FRAMES,
            settle_delay: Duration::from_secs(2),
            upsample: 1,
            jitters: 1,
        }
    }
}

impl EnrollmentOptions {
    pub fn from_config(config: &Config) -> Self {
        let enrollment = &config.enrollment;
        Self {
            max_frames: enrollment.max_frames.clamp(1, MAX_FRAMES),
            settle_delay: enrollment.settle_delay(),
            upsample: enrollment.upsample,
            jitters: enrollment.jitters.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentOutcome {
    pub record: ModelRecord,
    pub total_models: usize,
    pub stats: GateStats,
}

/// Frame whose detection pass found at least one face.
struct Capture {
    frame: DynamicImage,
    faces: Vec<FaceRectangle>,
}

pub struct Enrollment<'a> {
    store: &'a ModelStore,
    backend: &'a dyn RecognitionBackend,
    options: EnrollmentOptions,
}

impl<'a> Enrollment<'a> {
    pub fn new(
        store: &'a ModelStore,
        backend: &'a dyn RecognitionBackend,
        options: EnrollmentOptions,
    ) -> Self {
        Self { store, backend, options }
    }

    /// Runs one enrollment for `user`. The camera is opened through
    /// `open_capture` only after the label is settled, and released before
    /// any encoding work starts.
    pub fn run<F>(
        &self,
        user: &str,
        label: LabelChoice<'_>,
        open_capture: F,
    ) -> Result<EnrollmentOutcome>
    where
        F: FnOnce() -> Result<CaptureSession>,
    {
        let _lock = self.store.lock(user)?;
        let mut records = self.store.load(user)?;
        let id = next_id(&records)?;
        let label = resolve_label(label, id)?;

        let mut session = open_capture()?;
        let gate = IlluminationGate::new(session.config().dark_threshold);

        println!("Please look straight into the camera");
        if !self.options.settle_delay.is_zero() {
            std::thread::sleep(self.options.settle_delay);
        }

        let acquired = self.acquire(&mut session, &gate);
        session.release();
        let (capture, stats) = acquired?;
        tracing::debug!(
            "Read {} frame(s): {} unreadable, {} too dark",
            stats.frames,
            stats.unreadable,
            stats.too_dark
        );

        let capture = match capture {
            Some(capture) => capture,
            None => return Err(classify_failure(&stats, gate.dark_threshold())),
        };
        if capture.faces.len() > 1 {
            return Err(FaceAuthError::AmbiguousFace(capture.faces.len()));
        }

        let face = &capture.faces[0];
        let landmarks = self.backend.get_landmarks(&capture.frame, face)?;
        tracing::debug!(
            "{} placed {} landmarks on a {}x{} face",
            self.backend.name(),
            landmarks.points().len(),
            face.width(),
            face.height()
        );
        let encoding =
            self.backend.compute_encoding(&capture.frame, &landmarks, self.options.jitters)?;

        let record = ModelRecord {
            time: chrono::Utc::now().timestamp(),
            label,
            id,
            data: vec![encoding],
        };
        records.push(record.clone());
        self.store.save(user, &records)?;
        tracing::info!("Added model {} ({:?}) for {}", record.id, record.label, user);

        Ok(EnrollmentOutcome { record, total_models: records.len(), stats })
    }

    /// Reads frames until one passes the gate and shows a face, or the cap is hit.
    fn acquire(
        &self,
        session: &mut CaptureSession,
        gate: &IlluminationGate,
    ) -> Result<(Option<Capture>, GateStats)> {
        let mut stats = GateStats::default();

        for _ in 0..self.options.max_frames.min(MAX_FRAMES) {
            let sample = session.read_frame()?;
            let gray = sample.gray.to_luma8();
            let (equalized, verdict) = gate.assess(&gray);
            stats.record(&verdict);
            if !verdict.usable() {
                continue;
            }

            let faces = self.backend.detect_faces(&equalized, self.options.upsample)?;
            if !faces.is_empty() {
                return Ok((Some(Capture { frame: sample.color, faces }), stats));
            }
        }

        Ok((None, stats))
    }
}

fn classify_failure(stats: &GateStats, threshold: f64) -> FaceAuthError {
    match stats.average_darkness() {
        None => FaceAuthError::NoValidFrames,
        Some(average) if stats.too_dark == stats.valid => {
            FaceAuthError::AllFramesTooDark { average, threshold }
        }
        Some(_) => FaceAuthError::NoFaceDetected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::illumination::{DarknessVerdict, FrameClass};

    struct Scripted(Vec<&'static str>);

    impl LabelPrompt for Scripted {
        fn ask(&mut self, default: &str) -> Result<String> {
            Ok(self.0.pop().map(str::to_string).unwrap_or_else(|| default.to_string()))
        }
    }

    #[test]
    fn label_sources() {
        assert_eq!(resolve_label(LabelChoice::Automatic, 3).unwrap(), "Model #3");
        let explicit = LabelChoice::Explicit("Glasses, indoor".into());
        assert_eq!(resolve_label(explicit, 0).unwrap(), "Glasses indoor");

        let mut empty = Scripted(Vec::new());
        assert_eq!(resolve_label(LabelChoice::Interactive(&mut empty), 7).unwrap(), "Model #7");
        let mut typed = Scripted(vec!["a label that is far too long to keep"]);
        let label = resolve_label(LabelChoice::Interactive(&mut typed), 7).unwrap();
        assert_eq!(label.chars().count(), 24);
    }

    #[test]
    fn config_frame_cap_cannot_exceed_sixty() {
        let mut config = Config::from_toml("[video]\ndevice_path = \"/dev/video0\"\n").unwrap();
        config.enrollment.max_frames = 500;
        config.enrollment.jitters = 0;
        let options = EnrollmentOptions::from_config(&config);
        assert_eq!(options.max_frames, MAX_FRAMES);
        assert_eq!(options.jitters, 1);
    }

    #[test]
    fn failure_classification() {
        let mut stats = GateStats::default();
        stats.record(&DarknessVerdict { score: 100.0, class: FrameClass::Unreadable });
        assert!(matches!(classify_failure(&stats, 60.0), FaceAuthError::NoValidFrames));

        stats.record(&DarknessVerdict { score: 90.0, class: FrameClass::TooDark });
        stats.record(&DarknessVerdict { score: 70.0, class: FrameClass::TooDark });
        match classify_failure(&stats, 60.0) {
            FaceAuthError::AllFramesTooDark { average, threshold } => {
                assert_eq!(average, 80.0);
                assert_eq!(threshold, 60.0);
            }
            other => panic!("unexpected: {}", other),
        }

        stats.record(&DarknessVerdict { score: 10.0, class: FrameClass::Usable });
        assert!(matches!(classify_failure(&stats, 60.0), FaceAuthError::NoFaceDetected));
    }
}
