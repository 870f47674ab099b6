use crate::common::{FaceAuthError, Result};
use image::{ColorType, DynamicImage, GrayImage, ImageBuffer, ImageFormat, Luma, Rgb, RgbImage};

/// Pixel layouts the frame sources can hand over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Grey,
    Yuyv,
    Mjpeg,
    Rgb24,
}

impl PixelFormat {
    pub fn from_fourcc(repr: [u8; 4]) -> Option<Self> {
        match &repr {
            b"GREY" | b"Y8  " => Some(PixelFormat::Grey),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }

    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Grey => *b"GREY",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Rgb24 => *b"RGB3",
        }
    }
}

/// One undecoded buffer as delivered by a frame source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self { format, width, height, data }
    }

    pub fn decode(&self) -> Result<DynamicImage> {
        let pixels = (self.width as usize) * (self.height as usize);
        match self.format {
            PixelFormat::Grey => {
                let data = self.data.get(..pixels).ok_or_else(|| short_buffer(self, pixels))?;
                ImageBuffer::<Luma<u8>, _>::from_raw(self.width, self.height, data.to_vec())
                    .map(DynamicImage::ImageLuma8)
                    .ok_or_else(|| {
                        FaceAuthError::FrameDecode("Failed to create grayscale image buffer".into())
                    })
            }
            PixelFormat::Rgb24 => {
                let data =
                    self.data.get(..pixels * 3).ok_or_else(|| short_buffer(self, pixels * 3))?;
                ImageBuffer::<Rgb<u8>, _>::from_raw(self.width, self.height, data.to_vec())
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| {
                        FaceAuthError::FrameDecode("Failed to create RGB image buffer".into())
                    })
            }
            PixelFormat::Yuyv => {
                let data =
                    self.data.get(..pixels * 2).ok_or_else(|| short_buffer(self, pixels * 2))?;
                yuyv_to_rgb(data, self.width, self.height).map(DynamicImage::ImageRgb8)
            }
            PixelFormat::Mjpeg => image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg)
                .map_err(|e| FaceAuthError::FrameDecode(format!("MJPEG frame: {}", e))),
        }
    }
}

fn short_buffer(frame: &RawFrame, expected: usize) -> FaceAuthError {
    FaceAuthError::FrameDecode(format!(
        "{:?} buffer holds {} bytes, {}x{} needs {}",
        frame.format,
        frame.data.len(),
        frame.width,
        frame.height,
        expected
    ))
}

/// YUYV packs two pixels per 4 bytes, so the pixel count must be even.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data.chunks_exact(4) {
        let (y0, y1) = (chunk[0] as f32, chunk[2] as f32);
        let (u, v) = (chunk[1] as f32 - 128.0, chunk[3] as f32 - 128.0);
        for y in [y0, y1] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344_136 * u - 0.714_136 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }
    RgbImage::from_raw(width, height, rgb).ok_or_else(|| {
        let reason = format!("YUYV frame of {}x{} has an odd pixel count", width, height);
        FaceAuthError::FrameDecode(reason)
    })
}

/// Why a color frame could not be turned into a grayscale one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrayscaleError {
    /// The frame already has a single channel (IR cameras).
    SingleChannel,
    Unsupported(ColorType),
}

pub fn to_grayscale(frame: &DynamicImage) -> std::result::Result<GrayImage, GrayscaleError> {
    match frame {
        DynamicImage::ImageLuma8(_) => Err(GrayscaleError::SingleChannel),
        DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageRgba8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => Ok(frame.to_luma8()),
        other => Err(GrayscaleError::Unsupported(other.color())),
    }
}

/// Samples every 10th row and column; one pixel with unequal channels makes the frame color.
pub fn is_gray_frame(frame: &DynamicImage) -> bool {
    if frame.color().channel_count() < 3 {
        return true;
    }

    let rgb = frame.to_rgb8();
    for y in (0..rgb.height()).step_by(10) {
        for x in (0..rgb.width()).step_by(10) {
            let [r, g, b] = rgb.get_pixel(x, y).0;
            if r != g || g != b {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_grey_and_ignores_stride_padding() {
        let mut data = vec![7u8; 4 * 3];
        data.extend_from_slice(&[0, 0, 0, 0]);
        let frame = RawFrame::new(PixelFormat::Grey, 4, 3, data);
        let image = frame.decode().unwrap();
        assert_eq!(image.color(), ColorType::L8);
        assert_eq!(image.to_luma8().get_pixel(3, 2).0, [7]);
    }

    #[test]
    fn short_buffer_is_a_decode_error() {
        let frame = RawFrame::new(PixelFormat::Rgb24, 4, 4, vec![0; 10]);
        assert!(matches!(frame.decode(), Err(FaceAuthError::FrameDecode(_))));
    }

    #[test]
    fn yuyv_neutral_chroma_gives_gray_pixels() {
        let frame = RawFrame::new(PixelFormat::Yuyv, 2, 1, vec![100, 128, 200, 128]);
        let rgb = frame.decode().unwrap().to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0).0, [100, 100, 100]);
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn yuyv_with_odd_pixel_count_is_a_decode_error() {
        let frame = RawFrame::new(PixelFormat::Yuyv, 3, 1, vec![100, 128, 200, 128, 150, 128]);
        match frame.decode() {
            Err(FaceAuthError::FrameDecode(reason)) => {
                assert!(reason.contains("3x1"), "{}", reason)
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("odd-sized YUYV frame decoded"),
        }
    }

    #[test]
    fn single_channel_frames_are_not_converted() {
        let gray = DynamicImage::ImageLuma8(GrayImage::new(2, 2));
        assert!(matches!(to_grayscale(&gray), Err(GrayscaleError::SingleChannel)));

        let color = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        assert!(to_grayscale(&color).is_ok());
    }

    #[test]
    fn gray_detection_samples_grid() {
        let mut rgb = RgbImage::from_pixel(30, 30, Rgb([50, 50, 50]));
        assert!(is_gray_frame(&DynamicImage::ImageRgb8(rgb.clone())));

        // Off-grid pixels are never inspected
        rgb.put_pixel(5, 5, Rgb([255, 0, 0]));
        assert!(is_gray_frame(&DynamicImage::ImageRgb8(rgb.clone())));

        rgb.put_pixel(10, 20, Rgb([255, 0, 0]));
        assert!(!is_gray_frame(&DynamicImage::ImageRgb8(rgb)));
    }

    #[test]
    fn fourcc_round_trip_for_known_formats() {
        assert_eq!(PixelFormat::from_fourcc(*b"MJPG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(*b"GREY"), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(*b"H264"), None);
    }
}
