//! Frame type and image helpers — YUYV conversion, dark detection,
//! box and caption annotation and JPEG encoding.

use font8x8::UnicodeFonts;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);

/// A captured colour camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&image, 0.95);
        Self {
            image,
            sequence,
            is_dark,
        }
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.image.width() as usize * self.image.height() as usize;
        if pixels == 0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(*p) as f32).sum::<f32>() / pixels as f32
    }
}

/// BT.601 luma of an RGB pixel.
fn luma(p: Rgb<u8>) -> u8 {
    let [r, g, b] = p.0;
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000) as u8
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// Every 4 bytes `[Y0, U, Y1, V]` carry two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(expected / 2 * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push((y + 1.402 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344_136 * u - 0.714_136 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).round().clamp(0.0, 255.0) as u8);
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// True if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = image.width() as usize * image.height() as usize;
    if total == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| luma(**p) < 32).count();
    (dark as f32 / total as f32) > threshold_pct
}

/// Draw a rectangle outline, clipped to the image.
pub fn draw_rect(image: &mut RgbImage, x: i64, y: i64, w: u32, h: u32, color: Rgb<u8>, thickness: u32) {
    let (iw, ih) = (image.width() as i64, image.height() as i64);
    let (x1, y1) = (x + w as i64 - 1, y + h as i64 - 1);
    let t = thickness as i64;

    for py in y.max(0)..=y1.min(ih - 1) {
        for px in x.max(0)..=x1.min(iw - 1) {
            let on_edge = px < x + t || px > x1 - t || py < y + t || py > y1 - t;
            if on_edge {
                image.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}

/// Glyph cell size of [`draw_text`] at scale 1.
pub const GLYPH_SIZE: u32 = 8;

/// Draw `text` with its top-left corner at (`x`, `y`) on a black band,
/// using the 8x8 bitmap font magnified `scale` times. Characters outside
/// basic Latin render as `?`. Clipped to the image.
pub fn draw_text(image: &mut RgbImage, x: i64, y: i64, text: &str, color: Rgb<u8>, scale: u32) {
    let scale = scale.max(1);
    let cell = (GLYPH_SIZE * scale) as i64;
    let (iw, ih) = (image.width() as i64, image.height() as i64);
    let mut put = |px: i64, py: i64, c: Rgb<u8>| {
        if (0..iw).contains(&px) && (0..ih).contains(&py) {
            image.put_pixel(px as u32, py as u32, c);
        }
    };

    let band = cell * text.chars().count() as i64;
    for py in y..y + cell {
        for px in x..x + band {
            put(px, py, Rgb([0, 0, 0]));
        }
    }

    for (i, ch) in text.chars().enumerate() {
        let Some(glyph) = font8x8::BASIC_FONTS.get(ch).or_else(|| font8x8::BASIC_FONTS.get('?'))
        else {
            continue;
        };
        let origin = x + i as i64 * cell;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                if *bits & (1u8 << col) == 0 {
                    continue;
                }
                let gx = origin + (col * scale) as i64;
                let gy = y + (row as u32 * scale) as i64;
                for dy in 0..scale as i64 {
                    for dx in 0..scale as i64 {
                        put(gx + dx, gy + dy, color);
                    }
                }
            }
        }
    }
}

/// Fill the image with a dim grey frame used when the camera fails.
pub fn placeholder(width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, Rgb([24, 24, 24]));
    draw_rect(&mut image, 0, 0, width, height, RED, 4);
    image
}

/// Encode an RGB image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(buf)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("jpeg encoding failed: {0}")]
    Encode(String),
    #[error("jpeg decoding failed: {0}")]
    Decode(String),
}
