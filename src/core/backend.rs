use crate::common::{Config, Result};
use image::{DynamicImage, GrayImage};
use std::any::Any;
use std::fmt;
use std::path::Path;

/// Axis-aligned face box in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRectangle {
    pub top: i32,
    pub left: i32,
    pub right: i32,
    pub bottom: i32,
}

impl FaceRectangle {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { top, left, right, bottom }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LandmarkPoint {
    pub x: i32,
    pub y: i32,
}

/// Ordered landmark points plus whatever the producing backend needs to
/// compute an encoding from them. Callers pass it through untouched.
pub struct LandmarkSet {
    points: Vec<LandmarkPoint>,
    handle: Option<Box<dyn Any + Send + Sync>>,
}

impl LandmarkSet {
    pub fn new(points: Vec<LandmarkPoint>) -> Self {
        Self { points, handle: None }
    }

    pub fn with_handle<T: Any + Send + Sync>(points: Vec<LandmarkPoint>, handle: T) -> Self {
        Self { points, handle: Some(Box::new(handle)) }
    }

    pub fn points(&self) -> &[LandmarkPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The backend handle, if one of type `T` was attached.
    pub fn handle<T: Any>(&self) -> Option<&T> {
        self.handle.as_ref().and_then(|handle| handle.downcast_ref::<T>())
    }
}

impl fmt::Debug for LandmarkSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LandmarkSet")
            .field("points", &self.points)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

/// Double precision, like the stored model files.
pub type FaceEncoding = Vec<f64>;

/// Face detection, landmarking and encoding behind one seam.
pub trait RecognitionBackend {
    fn name(&self) -> &str;

    /// Zero or more faces in `gray`. Each upsample step looks for smaller faces.
    fn detect_faces(&self, gray: &GrayImage, upsample: u32) -> Result<Vec<FaceRectangle>>;

    /// Landmarks for a rectangle returned by `detect_faces` on the same frame.
    fn get_landmarks(&self, frame: &DynamicImage, face: &FaceRectangle) -> Result<LandmarkSet>;

    fn compute_encoding(
        &self,
        frame: &DynamicImage,
        landmarks: &LandmarkSet,
        jitters: u32,
    ) -> Result<FaceEncoding>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Frontal,
    Cnn,
}

impl DetectorKind {
    pub fn from_config(config: &Config) -> Self {
        if config.core.use_cnn {
            DetectorKind::Cnn
        } else {
            DetectorKind::Frontal
        }
    }
}

/// Builds the provider selected by `core.use_cnn`.
pub fn create_backend(config: &Config, models_dir: &Path) -> Result<Box<dyn RecognitionBackend>> {
    let kind = DetectorKind::from_config(config);
    tracing::debug!(
        "Loading recognition models ({:?} detector) from {}",
        kind,
        models_dir.display()
    );
    Ok(Box::new(crate::core::onnx::OnnxBackend::new(config, models_dir, kind)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Token(u8);

    #[test]
    fn handle_is_only_visible_as_its_own_type() {
        let points = vec![LandmarkPoint { x: 1, y: 2 }; 5];
        let set = LandmarkSet::with_handle(points, Token(7));
        assert_eq!(set.len(), 5);
        assert_eq!(set.handle::<Token>(), Some(&Token(7)));
        assert!(set.handle::<String>().is_none());
        assert!(LandmarkSet::new(Vec::new()).handle::<Token>().is_none());
    }

    #[test]
    fn rectangle_size_and_points_follow_the_corners() {
        let face = FaceRectangle::new(10, 20, 74, 100);
        assert_eq!((face.width(), face.height()), (64, 80));

        let points = vec![LandmarkPoint { x: 30, y: 50 }, LandmarkPoint { x: 54, y: 50 }];
        let set = LandmarkSet::new(points);
        assert_eq!(set.points()[1], LandmarkPoint { x: 54, y: 50 });
        assert!(!set.is_empty());
    }

    #[test]
    fn detector_follows_use_cnn() {
        let mut config = Config::from_toml("[video]\ndevice_path = \"/dev/video0\"\n").unwrap();
        assert_eq!(DetectorKind::from_config(&config), DetectorKind::Frontal);
        config.core.use_cnn = true;
        assert_eq!(DetectorKind::from_config(&config), DetectorKind::Cnn);
    }
}
