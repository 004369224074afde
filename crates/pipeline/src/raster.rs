//! Raster helpers shared by the alignment and diff stages: decoding,
//! PNG encoding, resampling and a small float image used by the
//! scale-space code.

use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, GrayImage, ImageEncoder, Luma, RgbImage};

use crate::error::VisionError;
use crate::transform::Similarity;

/// Paper colour used for pixels that fall outside a warped raster.
pub const BACKGROUND: u8 = 255;

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Decode any supported raster format into 8-bit luminance.
pub fn decode_gray(bytes: &[u8]) -> Result<GrayImage, VisionError> {
    let img = image::load_from_memory(bytes)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(VisionError::Image("raster has zero area".to_string()));
    }
    Ok(img.to_luma8())
}

pub fn encode_gray_png(img: &GrayImage) -> Result<Vec<u8>, VisionError> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf).write_image(
        img.as_raw(),
        img.width(),
        img.height(),
        ExtendedColorType::L8,
    )?;
    Ok(buf)
}

pub fn encode_rgb_png(img: &RgbImage) -> Result<Vec<u8>, VisionError> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf).write_image(
        img.as_raw(),
        img.width(),
        img.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Crop a rectangle, clamped to the raster bounds.
pub fn crop(img: &GrayImage, x: u32, y: u32, width: u32, height: u32) -> Result<GrayImage, VisionError> {
    let x = x.min(img.width());
    let y = y.min(img.height());
    let width = width.min(img.width() - x);
    let height = height.min(img.height() - y);
    if width == 0 || height == 0 {
        return Err(VisionError::Image(format!(
            "crop rectangle at ({x}, {y}) lies outside the {}x{} raster",
            img.width(),
            img.height()
        )));
    }
    Ok(imageops::crop_imm(img, x, y, width, height).to_image())
}

/// Shrink `img` so its longer side is at most `max_dimension`.
///
/// Returns the (possibly unchanged) raster and the factor that maps its
/// coordinates back to the original resolution.
pub fn downscale(img: &GrayImage, max_dimension: u32) -> (GrayImage, f64) {
    let longest = img.width().max(img.height());
    if longest <= max_dimension {
        return (img.clone(), 1.0);
    }
    let factor = longest as f64 / max_dimension as f64;
    let w = ((img.width() as f64 / factor).round() as u32).max(1);
    let h = ((img.height() as f64 / factor).round() as u32).max(1);
    let small = imageops::resize(img, w, h, FilterType::Triangle);
    let fx = img.width() as f64 / w as f64;
    let fy = img.height() as f64 / h as f64;
    (small, (fx + fy) / 2.0)
}

/// Bilinear sample at a sub-pixel location, `None` outside the raster.
pub fn sample_bilinear(img: &GrayImage, x: f64, y: f64) -> Option<f64> {
    let (w, h) = (img.width() as f64, img.height() as f64);
    if !(x >= 0.0 && y >= 0.0 && x <= w - 1.0 && y <= h - 1.0) {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let p = |xx: u32, yy: u32| img.get_pixel(xx, yy).0[0] as f64;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    Some(top * (1.0 - fy) + bottom * fy)
}

/// Resample `src` into a `width` x `height` frame.
///
/// `transform` maps `src` coordinates into the destination frame; every
/// destination pixel is pulled through its inverse.
pub fn warp(src: &GrayImage, transform: &Similarity, width: u32, height: u32) -> Result<GrayImage, VisionError> {
    let inverse = transform
        .inverse()
        .ok_or_else(|| VisionError::Image("transform is not invertible".to_string()))?;
    let mut out = GrayImage::from_pixel(width, height, Luma([BACKGROUND]));
    for y in 0..height {
        for x in 0..width {
            let (sx, sy) = inverse.apply(x as f64, y as f64);
            if let Some(v) = sample_bilinear(src, sx, sy) {
                out.put_pixel(x, y, Luma([v.round().clamp(0.0, 255.0) as u8]));
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// FloatImage
// ---------------------------------------------------------------------------

/// Single-channel `f32` raster with intensities in `0.0..=1.0`.
#[derive(Debug, Clone)]
pub struct FloatImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl FloatImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_gray(img: &GrayImage) -> Self {
        Self {
            width: img.width() as usize,
            height: img.height() as usize,
            data: img.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Read with coordinates clamped to the border.
    #[inline]
    pub fn at_clamped(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.at(x, y)
    }

    /// Separable Gaussian blur with clamped borders.
    pub fn blur(&self, sigma: f32) -> Self {
        if sigma <= 0.0 {
            return self.clone();
        }
        let kernel = gaussian_kernel(sigma);
        let radius = (kernel.len() / 2) as isize;

        let mut tmp = Self::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (i, k) in kernel.iter().enumerate() {
                    acc += k * self.at_clamped(x as isize + i as isize - radius, y as isize);
                }
                tmp.data[y * self.width + x] = acc;
            }
        }

        let mut out = Self::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (i, k) in kernel.iter().enumerate() {
                    acc += k * tmp.at_clamped(x as isize, y as isize + i as isize - radius);
                }
                out.data[y * self.width + x] = acc;
            }
        }
        out
    }

    /// Take every second pixel in each direction.
    pub fn half(&self) -> Self {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut out = Self::new(width, height);
        for y in 0..height {
            for x in 0..width {
                out.data[y * width + x] = self.at((x * 2).min(self.width - 1), (y * 2).min(self.height - 1));
            }
        }
        out
    }

    pub fn subtract(&self, other: &Self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: self.data.iter().zip(&other.data).map(|(a, b)| a - b).collect(),
        }
    }
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil().max(1.0) as isize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / denom).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_round_trip_preserves_dimensions() {
        let img = GrayImage::from_pixel(7, 5, Luma([12]));
        let bytes = encode_gray_png(&img).unwrap();
        let decoded = decode_gray(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (7, 5));
        assert_eq!(decoded.get_pixel(3, 3).0[0], 12);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_gray(b"definitely not a png").is_err());
    }

    #[test]
    fn downscale_reports_factor() {
        let img = GrayImage::new(400, 200);
        let (small, factor) = downscale(&img, 100);
        assert_eq!(small.dimensions(), (100, 50));
        assert!((factor - 4.0).abs() < 1e-9);

        let (same, factor) = downscale(&img, 1000);
        assert_eq!(same.dimensions(), (400, 200));
        assert_eq!(factor, 1.0);
    }

    #[test]
    fn crop_clamps_to_bounds() {
        let img = GrayImage::new(50, 40);
        let out = crop(&img, 30, 30, 100, 100).unwrap();
        assert_eq!(out.dimensions(), (20, 10));
        assert!(crop(&img, 60, 0, 10, 10).is_err());
    }

    #[test]
    fn bilinear_interpolates_between_pixels() {
        let mut img = GrayImage::from_pixel(2, 1, Luma([0]));
        img.put_pixel(1, 0, Luma([200]));
        assert_eq!(sample_bilinear(&img, 0.5, 0.0), Some(100.0));
        assert_eq!(sample_bilinear(&img, 1.5, 0.0), None);
    }

    #[test]
    fn identity_warp_is_lossless() {
        let mut img = GrayImage::from_pixel(10, 10, Luma([255]));
        img.put_pixel(4, 6, Luma([0]));
        let out = warp(&img, &Similarity::identity(), 10, 10).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn translation_warp_fills_background() {
        let img = GrayImage::from_pixel(10, 10, Luma([0]));
        let shift = Similarity::from_params(1.0, 0.0, 3.0, 0.0);
        let out = warp(&img, &shift, 10, 10).unwrap();
        assert_eq!(out.get_pixel(0, 5).0[0], BACKGROUND);
        assert_eq!(out.get_pixel(5, 5).0[0], 0);
    }

    #[test]
    fn blur_preserves_constant_image() {
        let mut img = FloatImage::new(8, 8);
        img.data.iter_mut().for_each(|v| *v = 0.5);
        let out = img.blur(1.6);
        assert!(out.data.iter().all(|v| (v - 0.5).abs() < 1e-5));
    }
}
