//! ONNX Runtime recognition provider.
//!
//! Three sessions: a YOLO-style face detector, a 5-point landmark regressor
//! run on the face crop, and an encoder run on a face chip aligned to the
//! eye landmarks.

use crate::common::config::DetectorConfig;
use crate::common::{Config, FaceAuthError, Result};
use crate::core::backend::{
    DetectorKind, FaceEncoding, FaceRectangle, LandmarkPoint, LandmarkSet, RecognitionBackend,
};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Landmark count the alignment needs.
pub const MIN_LANDMARKS: usize = 5;

/// Eye centres of the 112x112 reference chip the encoder was trained on.
const REFERENCE_LEFT_EYE: (f32, f32) = (38.2946, 51.6963);
const REFERENCE_RIGHT_EYE: (f32, f32) = (73.5318, 51.5014);
const REFERENCE_CHIP: f32 = 112.0;

const MIN_TILE: u32 = 32;
const MAX_FACES: usize = 5;

/// Detector box in pixel coordinates of whatever image it was found in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    fn offset(mut self, dx: f32, dy: f32) -> Self {
        self.x1 += dx;
        self.x2 += dx;
        self.y1 += dy;
        self.y2 += dy;
        self
    }

    fn to_rectangle(self) -> FaceRectangle {
        FaceRectangle::new(
            self.x1.round() as i32,
            self.y1.round() as i32,
            self.x2.round() as i32,
            self.y2.round() as i32,
        )
    }
}

/// Model files for one provider, resolved against the models directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub landmarks: PathBuf,
    pub encoder: PathBuf,
}

impl ModelPaths {
    pub fn resolve(config: &Config, models_dir: &Path, kind: DetectorKind) -> Self {
        let base = config.models.directory.as_deref().unwrap_or(models_dir);
        let join = |path: &Path| {
            if path.is_relative() {
                base.join(path)
            } else {
                path.to_path_buf()
            }
        };
        let detector = match kind {
            DetectorKind::Frontal => &config.models.detector,
            DetectorKind::Cnn => &config.models.detector_cnn,
        };

        Self {
            detector: join(detector),
            landmarks: join(&config.models.landmarks),
            encoder: join(&config.models.encoder),
        }
    }

    pub fn missing(&self) -> Vec<PathBuf> {
        [&self.detector, &self.landmarks, &self.encoder]
            .into_iter()
            .filter(|path| !path.exists())
            .cloned()
            .collect()
    }
}

/// Similarity transform from frame coordinates onto the encoder chip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceAlignment {
    matrix: [f32; 9],
}

impl FaceAlignment {
    /// Maps the two eye landmarks onto the reference eye positions of a
    /// `chip_size` square chip.
    pub fn from_eyes(left: LandmarkPoint, right: LandmarkPoint, chip_size: u32) -> Option<Self> {
        let scale = chip_size as f32 / REFERENCE_CHIP;
        let (p0, p1) = ((left.x as f32, left.y as f32), (right.x as f32, right.y as f32));
        let q0 = (REFERENCE_LEFT_EYE.0 * scale, REFERENCE_LEFT_EYE.1 * scale);
        let q1 = (REFERENCE_RIGHT_EYE.0 * scale, REFERENCE_RIGHT_EYE.1 * scale);

        let ds = (p1.0 - p0.0, p1.1 - p0.1);
        let dd = (q1.0 - q0.0, q1.1 - q0.1);
        let norm = ds.0 * ds.0 + ds.1 * ds.1;
        if norm < 1.0 {
            return None;
        }

        let a = (dd.0 * ds.0 + dd.1 * ds.1) / norm;
        let b = (dd.1 * ds.0 - dd.0 * ds.1) / norm;
        let tx = q0.0 - (a * p0.0 - b * p0.1);
        let ty = q0.1 - (b * p0.0 + a * p0.1);

        Some(Self { matrix: [a, -b, tx, b, a, ty, 0.0, 0.0, 1.0] })
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.matrix;
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    /// Small random rotation, scale and shift about the chip centre.
    fn jittered(&self, rng: &mut impl Rng, chip_size: u32) -> Self {
        let angle = rng.gen_range(-3.0f32..3.0).to_radians();
        let scale = rng.gen_range(0.95f32..1.05);
        let shift = chip_size as f32 * 0.02;
        let (dx, dy) = (rng.gen_range(-shift..=shift), rng.gen_range(-shift..=shift));
        let c = chip_size as f32 / 2.0;

        let (cos, sin) = (angle.cos() * scale, angle.sin() * scale);
        let jitter = [
            cos, -sin, c - cos * c + sin * c + dx,
            sin, cos, c - sin * c - cos * c + dy,
            0.0, 0.0, 1.0,
        ];
        Self { matrix: multiply(&jitter, &self.matrix) }
    }

    fn projection(&self) -> Option<Projection> {
        Projection::from_matrix(self.matrix)
    }
}

fn multiply(a: &[f32; 9], b: &[f32; 9]) -> [f32; 9] {
    let mut out = [0.0; 9];
    for row in 0..3 {
        for col in 0..3 {
            out[row * 3 + col] = (0..3).map(|k| a[row * 3 + k] * b[k * 3 + col]).sum();
        }
    }
    out
}

pub struct OnnxBackend {
    detector: Session,
    landmarks: Session,
    encoder: Session,
    _environment: Arc<Environment>,
    kind: DetectorKind,
    config: DetectorConfig,
}

impl OnnxBackend {
    pub fn new(config: &Config, models_dir: &Path, kind: DetectorKind) -> Result<Self> {
        let paths = ModelPaths::resolve(config, models_dir, kind);
        let missing = paths.missing();
        if !missing.is_empty() {
            return Err(FaceAuthError::ModelFilesMissing {
                directory: config
                    .models
                    .directory
                    .clone()
                    .unwrap_or_else(|| models_dir.to_path_buf()),
                missing,
            });
        }

        let environment = Arc::new(
            Environment::builder()
                .with_name("faceprint")
                .build()
                .map_err(|e| FaceAuthError::Model(format!("Failed to create environment: {}", e)))?,
        );

        let load = |path: &Path| -> Result<Session> {
            tracing::debug!("Loading model {}", path.display());
            let session = SessionBuilder::new(&environment)?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_model_from_file(path)?;
            Ok(session)
        };

        Ok(Self {
            detector: load(&paths.detector)?,
            landmarks: load(&paths.landmarks)?,
            encoder: load(&paths.encoder)?,
            _environment: environment,
            kind,
            config: config.detector.clone(),
        })
    }

    fn detect_boxes(&self, gray: &GrayImage) -> Result<Vec<FaceBox>> {
        let (orig_width, orig_height) = gray.dimensions();
        let (input_width, input_height) = (self.config.input_width, self.config.input_height);

        let resized;
        let input = if (orig_width, orig_height) == (input_width, input_height) {
            gray
        } else {
            resized = imageops::resize(gray, input_width, input_height, FilterType::Triangle);
            &resized
        };

        let mut array = Array4::<f32>::zeros((1, 3, input_height as usize, input_width as usize));
        for (x, y, pixel) in input.enumerate_pixels() {
            let value = pixel[0] as f32 / 255.0;
            for channel in 0..3 {
                array[[0, channel, y as usize, x as usize]] = value;
            }
        }

        let cow_array = CowArray::from(array.into_dyn());
        let input_tensor = Value::from_array(self.detector.allocator(), &cow_array)?;
        let outputs = self.detector.run(vec![input_tensor])?;
        let output = outputs
            .first()
            .ok_or_else(|| FaceAuthError::Model("Detector produced no output".into()))?
            .try_extract::<f32>()?
            .view()
            .to_owned();

        let shape = output.shape().to_vec();
        let data: Vec<f32> = output.iter().copied().collect();
        let boxes = parse_detections(&data, &shape, input_width as f32, input_height as f32);

        let scale_x = orig_width as f32 / input_width as f32;
        let scale_y = orig_height as f32 / input_height as f32;
        Ok(boxes
            .into_iter()
            .map(|b| FaceBox {
                x1: b.x1 * scale_x,
                y1: b.y1 * scale_y,
                x2: b.x2 * scale_x,
                y2: b.y2 * scale_y,
                confidence: b.confidence,
            })
            .collect())
    }

    fn run_landmarks(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        let size = self.config.landmark_input_size;
        let resized = imageops::resize(crop, size, size, FilterType::Triangle);
        let array = rgb_tensor(&resized, |v| v as f32 / 255.0);

        let cow_array = CowArray::from(array.into_dyn());
        let input_tensor = Value::from_array(self.landmarks.allocator(), &cow_array)?;
        let outputs = self.landmarks.run(vec![input_tensor])?;
        let values = outputs
            .first()
            .ok_or_else(|| FaceAuthError::Model("Landmark model produced no output".into()))?
            .try_extract::<f32>()?
            .view()
            .iter()
            .copied()
            .collect();
        Ok(values)
    }

    fn run_encoder(&self, chip: &RgbImage) -> Result<FaceEncoding> {
        let array = rgb_tensor(chip, |v| (v as f32 - 127.5) / 127.5);
        let cow_array = CowArray::from(array.into_dyn());
        let input_tensor = Value::from_array(self.encoder.allocator(), &cow_array)?;
        let outputs = self.encoder.run(vec![input_tensor])?;
        let encoding = outputs
            .first()
            .ok_or_else(|| FaceAuthError::Model("Encoder produced no output".into()))?
            .try_extract::<f32>()?
            .view()
            .iter()
            .map(|&v| f64::from(v))
            .collect();
        Ok(encoding)
    }
}

impl RecognitionBackend for OnnxBackend {
    fn name(&self) -> &str {
        match self.kind {
            DetectorKind::Frontal => "onnx",
            DetectorKind::Cnn => "onnx-cnn",
        }
    }

    fn detect_faces(&self, gray: &GrayImage, upsample: u32) -> Result<Vec<FaceRectangle>> {
        let (width, height) = gray.dimensions();
        let mut boxes = self.detect_boxes(gray)?;

        for (x, y, w, h) in tile_grid(width, height, upsample) {
            let tile = imageops::crop_imm(gray, x, y, w, h).to_image();
            let found = self.detect_boxes(&tile)?;
            boxes.extend(found.into_iter().map(|b| b.offset(x as f32, y as f32)));
        }

        let mut faces = apply_nms(boxes, self.config.nms_iou);
        faces.retain(|face| face.confidence >= self.config.detection_confidence);
        faces.truncate(MAX_FACES);
        tracing::debug!("Detector found {} face(s)", faces.len());

        Ok(faces.into_iter().map(FaceBox::to_rectangle).collect())
    }

    fn get_landmarks(&self, frame: &DynamicImage, face: &FaceRectangle) -> Result<LandmarkSet> {
        let rgb = frame.to_rgb8();
        let (left, top, width, height) = clamp_rectangle(face, rgb.width(), rgb.height())
            .ok_or_else(|| {
                FaceAuthError::Model(format!("Face rectangle {:?} lies outside the frame", face))
            })?;
        let crop = imageops::crop_imm(&rgb, left, top, width, height).to_image();

        let raw = self.run_landmarks(&crop)?;
        let input_size = self.config.landmark_input_size;
        let points = landmarks_from_output(&raw, input_size, left, top, width, height);
        if points.len() < MIN_LANDMARKS {
            return Err(FaceAuthError::Model(format!(
                "Landmark model returned {} points, need at least {}",
                points.len(),
                MIN_LANDMARKS
            )));
        }

        let alignment =
            FaceAlignment::from_eyes(points[0], points[1], self.config.encoder_input_size)
                .ok_or_else(|| {
                    FaceAuthError::Model("Eye landmarks coincide, cannot align face".into())
                })?;
        Ok(LandmarkSet::with_handle(points, alignment))
    }

    fn compute_encoding(
        &self,
        frame: &DynamicImage,
        landmarks: &LandmarkSet,
        jitters: u32,
    ) -> Result<FaceEncoding> {
        let alignment = *landmarks
            .handle::<FaceAlignment>()
            .ok_or_else(|| {
                FaceAuthError::Model("Landmarks were not produced by this backend".into())
            })?;

        let rgb = frame.to_rgb8();
        let size = self.config.encoder_input_size;
        let mut rng = rand::thread_rng();
        let mut sum: Option<FaceEncoding> = None;

        for round in 0..jitters.max(1) {
            let transform = if round == 0 { alignment } else { alignment.jittered(&mut rng, size) };
            let projection = transform
                .projection()
                .ok_or_else(|| FaceAuthError::Model("Face alignment is not invertible".into()))?;

            let mut chip = RgbImage::new(size, size);
            warp_into(&rgb, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut chip);
            let encoding = self.run_encoder(&chip)?;

            sum = Some(match sum {
                None => encoding,
                Some(mut acc) => {
                    for (a, v) in acc.iter_mut().zip(&encoding) {
                        *a += v;
                    }
                    acc
                }
            });
        }

        let rounds = f64::from(jitters.max(1));
        Ok(sum.unwrap_or_default().into_iter().map(|v| v / rounds).collect())
    }
}

fn rgb_tensor(image: &RgbImage, normalize: impl Fn(u8) -> f32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut array = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for channel in 0..3 {
            array[[0, channel, y as usize, x as usize]] = normalize(pixel[channel]);
        }
    }
    array
}

/// Overlapping tiles for each upsample level: 2x2 for level 1, 4x4 for level 2...
pub fn tile_grid(width: u32, height: u32, upsample: u32) -> Vec<(u32, u32, u32, u32)> {
    let mut tiles = Vec::new();
    for level in 1..=upsample.min(4) {
        let n = 1u32 << level;
        let (tile_w, tile_h) = (width / n, height / n);
        if tile_w < MIN_TILE || tile_h < MIN_TILE {
            break;
        }

        let (pad_x, pad_y) = (tile_w / 4, tile_h / 4);
        for row in 0..n {
            for col in 0..n {
                let x0 = (col * tile_w).saturating_sub(pad_x);
                let y0 = (row * tile_h).saturating_sub(pad_y);
                let x1 = ((col + 1) * tile_w + pad_x).min(width);
                let y1 = ((row + 1) * tile_h + pad_y).min(height);
                tiles.push((x0, y0, x1 - x0, y1 - y0));
            }
        }
    }
    tiles
}

/// YOLO output, either `[1, N, 5+]` or transposed `[1, 5+, N]`, in input-space pixels.
pub fn parse_detections(
    data: &[f32],
    shape: &[usize],
    input_width: f32,
    input_height: f32,
) -> Vec<FaceBox> {
    let (num_predictions, prediction_length, is_transposed) = match shape {
        [_, a, b] if (5..=10).contains(a) && b > a => (*b, *a, true),
        [_, a, b] => (*a, *b, false),
        [a, b] => (*a, *b, false),
        _ => {
            tracing::warn!("Unexpected detector output shape: {:?}", shape);
            return Vec::new();
        }
    };
    if prediction_length < 5 || data.len() < num_predictions * prediction_length {
        tracing::warn!("Detector output too short for shape {:?}", shape);
        return Vec::new();
    }

    let value = |i: usize, field: usize| {
        if is_transposed {
            data[field * num_predictions + i]
        } else {
            data[i * prediction_length + field]
        }
    };

    let mut faces = Vec::new();
    for i in 0..num_predictions {
        let (cx, cy, w, h) = (value(i, 0), value(i, 1), value(i, 2), value(i, 3));
        let confidence = value(i, 4);
        if confidence <= 0.001 {
            continue;
        }

        // Normalised outputs are scaled up to input pixels
        let normalized = cx <= 1.0 && cy <= 1.0 && w <= 1.0 && h <= 1.0;
        let (sx, sy) = if normalized { (input_width, input_height) } else { (1.0, 1.0) };
        let (cx, cy, w, h) = (cx * sx, cy * sy, w * sx, h * sy);

        let x1 = (cx - w / 2.0).max(0.0);
        let y1 = (cy - h / 2.0).max(0.0);
        let x2 = (cx + w / 2.0).min(input_width);
        let y2 = (cy + h / 2.0).min(input_height);
        if x2 - x1 > 10.0 && y2 - y1 > 10.0 {
            faces.push(FaceBox { x1, y1, x2, y2, confidence });
        }
    }
    faces
}

pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

fn clamp_rectangle(face: &FaceRectangle, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let left = face.left.clamp(0, width as i32) as u32;
    let top = face.top.clamp(0, height as i32) as u32;
    let right = face.right.clamp(0, width as i32) as u32;
    let bottom = face.bottom.clamp(0, height as i32) as u32;
    (right > left && bottom > top).then(|| (left, top, right - left, bottom - top))
}

/// Landmark regressor output as frame points. Values up to ~1 are taken as
/// fractions of the crop, larger values as pixels of the model input.
fn landmarks_from_output(
    raw: &[f32],
    input_size: u32,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
) -> Vec<LandmarkPoint> {
    let normalized = raw.iter().all(|v| v.abs() <= 1.5);
    let (sx, sy) = if normalized {
        (width as f32, height as f32)
    } else {
        (width as f32 / input_size as f32, height as f32 / input_size as f32)
    };

    raw.chunks_exact(2)
        .map(|xy| LandmarkPoint {
            x: (left as f32 + xy[0] * sx).round() as i32,
            y: (top as f32 + xy[1] * sy).round() as i32,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceBox {
        FaceBox { x1, y1, x2, y2, confidence }
    }

    #[test]
    fn parses_standard_and_transposed_layouts() {
        // six predictions, only the first above the noise floor
        let mut standard = vec![0.0f32; 6 * 5];
        standard[..5].copy_from_slice(&[320.0, 240.0, 100.0, 120.0, 0.9]);
        let boxes = parse_detections(&standard, &[1, 6, 5], 640.0, 640.0);
        assert_eq!(boxes, vec![face(270.0, 180.0, 370.0, 300.0, 0.9)]);

        let mut transposed = vec![0.0f32; 5 * 6];
        for field in 0..5 {
            for i in 0..6 {
                transposed[field * 6 + i] = standard[i * 5 + field];
            }
        }
        assert_eq!(parse_detections(&transposed, &[1, 5, 6], 640.0, 640.0), boxes);
    }

    #[test]
    fn normalised_coordinates_are_scaled_to_input() {
        let boxes = parse_detections(&[0.5, 0.5, 0.25, 0.25, 0.8], &[1, 1, 5], 640.0, 480.0);
        assert_eq!(boxes, vec![face(240.0, 180.0, 400.0, 300.0, 0.8)]);
    }

    #[test]
    fn nms_keeps_the_most_confident_of_overlapping_boxes() {
        let kept = apply_nms(
            vec![
                face(0.0, 0.0, 100.0, 100.0, 0.6),
                face(5.0, 5.0, 105.0, 105.0, 0.9),
                face(300.0, 300.0, 400.0, 400.0, 0.7),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn tile_grid_doubles_per_level_and_stops_at_small_tiles() {
        assert!(tile_grid(640, 480, 0).is_empty());
        assert_eq!(tile_grid(640, 480, 1).len(), 4);
        assert_eq!(tile_grid(640, 480, 2).len(), 4 + 16);
        // 64 / 4 = 16 < 32, so level 2 is skipped
        assert_eq!(tile_grid(64, 64, 2).len(), 4);
        for (x, y, w, h) in tile_grid(640, 480, 2) {
            assert!(x + w <= 640 && y + h <= 480);
        }
    }

    #[test]
    fn alignment_maps_eyes_onto_reference_chip() {
        let left = LandmarkPoint { x: 200, y: 150 };
        let right = LandmarkPoint { x: 260, y: 150 };
        let alignment = FaceAlignment::from_eyes(left, right, 112).unwrap();

        let (x, y) = alignment.apply(200.0, 150.0);
        assert!((x - REFERENCE_LEFT_EYE.0).abs() < 1e-3);
        assert!((y - REFERENCE_LEFT_EYE.1).abs() < 1e-3);
        let (x, y) = alignment.apply(260.0, 150.0);
        assert!((x - REFERENCE_RIGHT_EYE.0).abs() < 1e-3);
        assert!((y - REFERENCE_RIGHT_EYE.1).abs() < 1e-3);

        assert!(FaceAlignment::from_eyes(left, left, 112).is_none());
    }

    #[test]
    fn landmark_output_is_mapped_into_the_frame() {
        let normalized = [0.25, 0.5, 0.75, 0.5, 0.5, 0.6, 0.3, 0.8, 0.7, 0.8];
        let points = landmarks_from_output(&normalized, 112, 100, 50, 200, 100);
        assert_eq!(points.len(), 5);
        assert_eq!(points[0], LandmarkPoint { x: 150, y: 100 });
        assert_eq!(points[1], LandmarkPoint { x: 250, y: 100 });

        let pixels = [56.0, 56.0, 112.0, 0.0];
        let points = landmarks_from_output(&pixels, 112, 0, 0, 224, 224);
        assert_eq!(points, vec![LandmarkPoint { x: 112, y: 112 }, LandmarkPoint { x: 224, y: 0 }]);
    }

    #[test]
    fn missing_models_are_reported_before_loading_runtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("face_encoder.onnx"), b"").unwrap();
        let config = Config::from_toml("[video]\ndevice_path = \"/dev/video0\"\n").unwrap();

        let err = OnnxBackend::new(&config, dir.path(), DetectorKind::Cnn).err().unwrap();
        match err {
            FaceAuthError::ModelFilesMissing { directory, missing } => {
                assert_eq!(directory, dir.path());
                let expected = vec![
                    dir.path().join("face_detector_cnn.onnx"),
                    dir.path().join("face_landmarks_5.onnx"),
                ];
                assert_eq!(missing, expected);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
