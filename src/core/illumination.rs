//! Illumination gate: decides whether a frame is worth running detection on.
//!
//! The frame is first normalised with contrast-limited adaptive histogram
//! equalization (CLAHE), then bucketed into 8 equal-width intensity bins.
//! The darkness score is the share of pixels in the darkest bin.

use image::GrayImage;

pub const DARKNESS_BUCKETS: usize = 8;
pub const DEFAULT_DARK_THRESHOLD: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Fully black or degenerate capture.
    Unreadable,
    TooDark,
    Usable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DarknessVerdict {
    /// Percentage (0-100) of pixels in the darkest bucket.
    pub score: f64,
    pub class: FrameClass,
}

impl DarknessVerdict {
    pub fn usable(&self) -> bool {
        self.class == FrameClass::Usable
    }
}

/// Contrast-limited adaptive histogram equalization over a tile grid.
#[derive(Debug, Clone, Copy)]
pub struct Clahe {
    clip_limit: f32,
    grid_x: u32,
    grid_y: u32,
}

impl Default for Clahe {
    fn default() -> Self {
        Self::new(2.0, 8, 8)
    }
}

impl Clahe {
    pub fn new(clip_limit: f32, grid_x: u32, grid_y: u32) -> Self {
        Self { clip_limit, grid_x: grid_x.max(1), grid_y: grid_y.max(1) }
    }

    pub fn apply(&self, gray: &GrayImage) -> GrayImage {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return gray.clone();
        }

        let grid_x = self.grid_x.min(width);
        let grid_y = self.grid_y.min(height);
        let tile_x = |i: u32| (i * width / grid_x, (i + 1) * width / grid_x);
        let tile_y = |j: u32| (j * height / grid_y, (j + 1) * height / grid_y);

        let mut luts = Vec::with_capacity((grid_x * grid_y) as usize);
        for j in 0..grid_y {
            for i in 0..grid_x {
                let (x0, x1) = tile_x(i);
                let (y0, y1) = tile_y(j);
                luts.push(self.tile_lut(gray, x0, x1, y0, y1));
            }
        }

        let tile_w = width as f32 / grid_x as f32;
        let tile_h = height as f32 / grid_y as f32;
        let mut out = GrayImage::new(width, height);

        for y in 0..height {
            let (ty1, ty2, wy) = neighbours(y, tile_h, grid_y);
            for x in 0..width {
                let (tx1, tx2, wx) = neighbours(x, tile_w, grid_x);
                let v = gray.get_pixel(x, y)[0] as usize;
                let lut = |tx: u32, ty: u32| luts[(ty * grid_x + tx) as usize][v] as f32;

                let top = lut(tx1, ty1) * (1.0 - wx) + lut(tx2, ty1) * wx;
                let bottom = lut(tx1, ty2) * (1.0 - wx) + lut(tx2, ty2) * wx;
                let value = top * (1.0 - wy) + bottom * wy;
                out.put_pixel(x, y, image::Luma([value.round().clamp(0.0, 255.0) as u8]));
            }
        }

        out
    }

    fn tile_lut(&self, gray: &GrayImage, x0: u32, x1: u32, y0: u32, y1: u32) -> [u8; 256] {
        let mut hist = [0u32; 256];
        for y in y0..y1 {
            for x in x0..x1 {
                hist[gray.get_pixel(x, y)[0] as usize] += 1;
            }
        }

        let area = (x1 - x0) * (y1 - y0);
        if self.clip_limit > 0.0 {
            let limit = ((self.clip_limit * area as f32 / 256.0) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }

            let batch = excess / 256;
            let mut residual = excess % 256;
            for bin in hist.iter_mut() {
                *bin += batch;
            }
            if residual > 0 {
                let step = (256 / residual).max(1) as usize;
                for bin in hist.iter_mut().step_by(step) {
                    if residual == 0 {
                        break;
                    }
                    *bin += 1;
                    residual -= 1;
                }
            }
        }

        let scale = 255.0 / area.max(1) as f32;
        let mut lut = [0u8; 256];
        let mut cumulative = 0u32;
        for (value, bin) in hist.iter().enumerate() {
            cumulative += bin;
            lut[value] = (cumulative as f32 * scale).round().min(255.0) as u8;
        }
        lut
    }
}

/// The two tile centres around `pos` and the weight of the second one.
fn neighbours(pos: u32, tile_size: f32, grid: u32) -> (u32, u32, f32) {
    let f = (pos as f32 + 0.5) / tile_size - 0.5;
    let lower = f.floor();
    let weight = f - lower;
    let first = (lower.max(0.0) as u32).min(grid - 1);
    let second = ((lower + 1.0).max(0.0) as u32).min(grid - 1);
    (first, second, weight)
}

/// Counts of pixels in 8 equal-width intensity buckets over the whole frame.
pub fn histogram(gray: &GrayImage) -> [u64; DARKNESS_BUCKETS] {
    let mut buckets = [0u64; DARKNESS_BUCKETS];
    for pixel in gray.pixels() {
        buckets[(pixel[0] as usize) * DARKNESS_BUCKETS / 256] += 1;
    }
    buckets
}

pub fn classify_histogram(
    buckets: &[u64; DARKNESS_BUCKETS],
    dark_threshold: f64,
) -> DarknessVerdict {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return DarknessVerdict { score: 0.0, class: FrameClass::Unreadable };
    }

    // Everything in the darkest bucket counts as a bad read, not a dark scene
    if buckets[0] == total {
        return DarknessVerdict { score: 100.0, class: FrameClass::Unreadable };
    }

    let score = buckets[0] as f64 / total as f64 * 100.0;
    let class = if score > dark_threshold { FrameClass::TooDark } else { FrameClass::Usable };
    DarknessVerdict { score, class }
}

pub struct IlluminationGate {
    clahe: Clahe,
    dark_threshold: f64,
}

impl IlluminationGate {
    pub fn new(dark_threshold: f64) -> Self {
        Self { clahe: Clahe::default(), dark_threshold }
    }

    pub fn dark_threshold(&self) -> f64 {
        self.dark_threshold
    }

    /// Equalizes the frame and classifies it. The equalized frame is what
    /// detection should run on.
    pub fn assess(&self, gray: &GrayImage) -> (GrayImage, DarknessVerdict) {
        let equalized = self.clahe.apply(gray);
        let verdict = classify_histogram(&histogram(&equalized), self.dark_threshold);
        (equalized, verdict)
    }
}

/// Running counters over the frames seen by one acquisition loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateStats {
    pub frames: usize,
    pub unreadable: usize,
    pub valid: usize,
    pub too_dark: usize,
    pub darkness_total: f64,
}

impl GateStats {
    pub fn record(&mut self, verdict: &DarknessVerdict) {
        self.frames += 1;
        match verdict.class {
            FrameClass::Unreadable => self.unreadable += 1,
            FrameClass::TooDark => {
                self.valid += 1;
                self.too_dark += 1;
                self.darkness_total += verdict.score;
            }
            FrameClass::Usable => {
                self.valid += 1;
                self.darkness_total += verdict.score;
            }
        }
    }

    pub fn average_darkness(&self) -> Option<f64> {
        (self.valid > 0).then(|| self.darkness_total / self.valid as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([(x * 255 / (width - 1)) as u8]))
    }

    #[test]
    fn all_darkest_bucket_is_unreadable_not_too_dark() {
        let verdict = classify_histogram(&[500, 0, 0, 0, 0, 0, 0, 0], DEFAULT_DARK_THRESHOLD);
        assert_eq!(verdict.class, FrameClass::Unreadable);
        assert_eq!(verdict.score, 100.0);
    }

    #[test]
    fn empty_histogram_is_unreadable() {
        let verdict = classify_histogram(&[0; 8], DEFAULT_DARK_THRESHOLD);
        assert_eq!(verdict.class, FrameClass::Unreadable);
    }

    #[test]
    fn darkness_is_share_of_first_bucket() {
        let verdict = classify_histogram(&[70, 0, 0, 0, 0, 0, 0, 30], DEFAULT_DARK_THRESHOLD);
        assert_eq!(verdict.class, FrameClass::TooDark);
        assert!((verdict.score - 70.0).abs() < 1e-9);

        let verdict = classify_histogram(&[60, 40, 0, 0, 0, 0, 0, 0], DEFAULT_DARK_THRESHOLD);
        assert_eq!(verdict.class, FrameClass::Usable, "threshold itself is not too dark");
    }

    #[test]
    fn histogram_uses_equal_width_buckets() {
        let gray = GrayImage::from_raw(4, 1, vec![0, 31, 32, 255]).unwrap();
        assert_eq!(histogram(&gray), [2, 1, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn black_frame_stays_unreadable_after_equalization() {
        let gate = IlluminationGate::new(DEFAULT_DARK_THRESHOLD);
        let (_, verdict) = gate.assess(&GrayImage::new(64, 48));
        assert_eq!(verdict.class, FrameClass::Unreadable);
    }

    #[test]
    fn gradient_frame_is_usable() {
        let gate = IlluminationGate::new(DEFAULT_DARK_THRESHOLD);
        let (equalized, verdict) = gate.assess(&gradient(64, 48));
        assert_eq!(equalized.dimensions(), (64, 48));
        assert_eq!(verdict.class, FrameClass::Usable);
        assert!(verdict.score < 30.0);
    }

    #[test]
    fn clahe_maps_a_flat_frame_to_a_flat_frame() {
        let flat = GrayImage::from_pixel(64, 48, Luma([100]));
        let equalized = Clahe::default().apply(&flat);
        let first = equalized.get_pixel(0, 0)[0];
        assert!(equalized.pixels().all(|p| p[0] == first));
    }

    #[test]
    fn stats_track_valid_and_dark_frames() {
        let mut stats = GateStats::default();
        stats.record(&DarknessVerdict { score: 100.0, class: FrameClass::Unreadable });
        stats.record(&DarknessVerdict { score: 80.0, class: FrameClass::TooDark });
        stats.record(&DarknessVerdict { score: 20.0, class: FrameClass::Usable });

        assert_eq!(stats.frames, 3);
        assert_eq!(stats.unreadable, 1);
        assert_eq!(stats.valid, 2);
        assert_eq!(stats.too_dark, 1);
        assert_eq!(stats.average_darkness(), Some(50.0));
    }
}
