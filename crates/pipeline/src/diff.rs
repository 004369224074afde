//! Resample the newer raster into the older one's frame and render the
//! overlay, addition and deletion artifacts.

use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::config::DiffConfig;
use crate::error::VisionError;
use crate::raster::warp;
use crate::transform::Similarity;

const INK: u8 = 0;
const PAPER: u8 = 255;

#[derive(Debug, Clone)]
pub struct DiffArtifacts {
    /// R = new, G = min(old, new), B = old. Unchanged linework renders
    /// black, deletions red, additions blue.
    pub overlay: RgbImage,
    /// White raster with black marks where ink exists only in `new`.
    pub additions: GrayImage,
    /// White raster with black marks where ink exists only in `old`.
    pub deletions: GrayImage,
    pub added_pixels: u64,
    pub deleted_pixels: u64,
}

/// Diff `new` against `old`; `transform` maps `new` into `old`'s frame and
/// all artifacts share `old`'s dimensions.
pub fn render_diff(
    new: &GrayImage,
    old: &GrayImage,
    transform: &Similarity,
    config: &DiffConfig,
) -> Result<DiffArtifacts, VisionError> {
    let (width, height) = old.dimensions();
    let aligned = warp(new, transform, width, height)?;
    Ok(diff_aligned(&aligned, old, config))
}

/// Diff two rasters already in the same frame.
pub fn diff_aligned(new: &GrayImage, old: &GrayImage, config: &DiffConfig) -> DiffArtifacts {
    let (width, height) = old.dimensions();
    let threshold = config.intensity_threshold as i16;
    let mut overlay = RgbImage::new(width, height);
    let mut additions = GrayImage::from_pixel(width, height, Luma([PAPER]));
    let mut deletions = GrayImage::from_pixel(width, height, Luma([PAPER]));
    let (mut added_pixels, mut deleted_pixels) = (0u64, 0u64);

    for (x, y, o) in old.enumerate_pixels() {
        let o = o.0[0];
        let n = if x < new.width() && y < new.height() {
            new.get_pixel(x, y).0[0]
        } else {
            PAPER
        };
        overlay.put_pixel(x, y, Rgb([n, o.min(n), o]));

        let delta = o as i16 - n as i16;
        if delta > threshold {
            additions.put_pixel(x, y, Luma([INK]));
            added_pixels += 1;
        } else if -delta > threshold {
            deletions.put_pixel(x, y, Luma([INK]));
            deleted_pixels += 1;
        }
    }

    tracing::debug!(added_pixels, deleted_pixels, "Diff rendered");
    DiffArtifacts {
        overlay,
        additions,
        deletions,
        added_pixels,
        deleted_pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> GrayImage {
        GrayImage::from_pixel(20, 20, Luma([PAPER]))
    }

    #[test]
    fn identical_images_have_no_marks() {
        let mut img = blank();
        img.put_pixel(5, 5, Luma([INK]));
        let out = diff_aligned(&img, &img, &DiffConfig::default());
        assert_eq!(out.added_pixels, 0);
        assert_eq!(out.deleted_pixels, 0);
        assert_eq!(out.overlay.get_pixel(5, 5), &Rgb([0, 0, 0]));
    }

    #[test]
    fn polarity_is_respected() {
        let old = blank();
        let mut new = blank();
        new.put_pixel(3, 4, Luma([INK]));
        let out = diff_aligned(&new, &old, &DiffConfig::default());
        assert_eq!(out.added_pixels, 1);
        assert_eq!(out.additions.get_pixel(3, 4).0[0], INK);
        assert_eq!(out.deletions.get_pixel(3, 4).0[0], PAPER);
        assert_eq!(out.overlay.get_pixel(3, 4), &Rgb([0, 0, 255]));

        let swapped = diff_aligned(&old, &new, &DiffConfig::default());
        assert_eq!(swapped.deleted_pixels, 1);
        assert_eq!(swapped.added_pixels, 0);
    }

    #[test]
    fn faint_differences_are_suppressed() {
        let old = blank();
        let new = GrayImage::from_pixel(20, 20, Luma([PAPER - 40]));
        let out = diff_aligned(&new, &old, &DiffConfig::default());
        assert_eq!(out.added_pixels, 0);
    }

    #[test]
    fn render_uses_old_dimensions() {
        let old = GrayImage::from_pixel(30, 10, Luma([PAPER]));
        let new = blank();
        let out = render_diff(&new, &old, &Similarity::identity(), &DiffConfig::default()).unwrap();
        assert_eq!(out.additions.dimensions(), (30, 10));
        assert_eq!(out.overlay.dimensions(), (30, 10));
    }
}
