//! Connected change regions from an addition or deletion raster.
//!
//! Binarise, open with a square structuring element to drop speckle,
//! label 8-connected components and keep those above a minimum area.

use image::GrayImage;
use plandiff_core::models::Region;

use crate::config::DiffConfig;

/// Which mask a region came from; drives labels and descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Addition,
    Deletion,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Addition => "addition",
            Self::Deletion => "deletion",
        }
    }

    fn noun(&self) -> &'static str {
        match self {
            Self::Addition => "Added",
            Self::Deletion => "Removed",
        }
    }
}

/// Boolean raster, row-major.
#[derive(Debug, Clone, PartialEq)]
struct Mask {
    width: usize,
    height: usize,
    bits: Vec<bool>,
}

impl Mask {
    fn get(&self, x: isize, y: isize) -> bool {
        x >= 0
            && y >= 0
            && (x as usize) < self.width
            && (y as usize) < self.height
            && self.bits[y as usize * self.width + x as usize]
    }
}

fn binarize(img: &GrayImage, threshold: u8) -> Mask {
    Mask {
        width: img.width() as usize,
        height: img.height() as usize,
        bits: img.as_raw().iter().map(|&v| v < threshold).collect(),
    }
}

/// Square erosion; out-of-bounds neighbours count as background.
fn erode(mask: &Mask, radius: isize) -> Mask {
    let mut bits = vec![false; mask.bits.len()];
    for y in 0..mask.height {
        for x in 0..mask.width {
            let keep = (-radius..=radius).all(|dy| {
                (-radius..=radius).all(|dx| mask.get(x as isize + dx, y as isize + dy))
            });
            bits[y * mask.width + x] = keep;
        }
    }
    Mask { bits, ..*mask }
}

fn dilate(mask: &Mask, radius: isize) -> Mask {
    let mut bits = vec![false; mask.bits.len()];
    for y in 0..mask.height {
        for x in 0..mask.width {
            let hit = (-radius..=radius).any(|dy| {
                (-radius..=radius).any(|dx| mask.get(x as isize + dx, y as isize + dy))
            });
            bits[y * mask.width + x] = hit;
        }
    }
    Mask { bits, ..*mask }
}

fn open(mask: &Mask, kernel: u32) -> Mask {
    let radius = (kernel / 2) as isize;
    if radius == 0 {
        return mask.clone();
    }
    dilate(&erode(mask, radius), radius)
}

struct Component {
    area: u32,
    x_min: u32,
    y_min: u32,
    x_max: u32,
    y_max: u32,
}

fn components(mask: &Mask) -> Vec<Component> {
    let mut seen = vec![false; mask.bits.len()];
    let mut stack = Vec::new();
    let mut out = Vec::new();

    for start in 0..mask.bits.len() {
        if !mask.bits[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);
        let mut c = Component {
            area: 0,
            x_min: u32::MAX,
            y_min: u32::MAX,
            x_max: 0,
            y_max: 0,
        };
        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % mask.width, idx / mask.width);
            c.area += 1;
            c.x_min = c.x_min.min(x as u32);
            c.y_min = c.y_min.min(y as u32);
            c.x_max = c.x_max.max(x as u32);
            c.y_max = c.y_max.max(y as u32);
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let (nx, ny) = (x as isize + dx, y as isize + dy);
                    if !mask.get(nx, ny) {
                        continue;
                    }
                    let n = ny as usize * mask.width + nx as usize;
                    if !seen[n] {
                        seen[n] = true;
                        stack.push(n);
                    }
                }
            }
        }
        out.push(c);
    }
    out
}

/// Extract regions from a white raster with dark change marks.
///
/// Regions are ordered top-to-bottom, left-to-right and labelled
/// `"<polarity>-<n>"` starting at 1. Bounds are inclusive.
pub fn extract_regions(img: &GrayImage, polarity: Polarity, config: &DiffConfig) -> Vec<Region> {
    let mask = open(&binarize(img, config.binarize_threshold), config.opening_kernel);
    let mut found: Vec<Component> = components(&mask)
        .into_iter()
        .filter(|c| c.area >= config.min_region_area)
        .collect();
    found.sort_by_key(|c| (c.y_min, c.x_min));

    found
        .iter()
        .enumerate()
        .map(|(i, c)| Region {
            label: format!("{}-{}", polarity.as_str(), i + 1),
            x_min: c.x_min,
            x_max: c.x_max,
            y_min: c.y_min,
            y_max: c.y_max,
            description: format!(
                "{} content, {} px over {}x{} px at ({}, {})",
                polarity.noun(),
                c.area,
                c.x_max - c.x_min + 1,
                c.y_max - c.y_min + 1,
                c.x_min,
                c.y_min
            ),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn canvas() -> GrayImage {
        GrayImage::from_pixel(100, 100, Luma([255]))
    }

    fn fill(img: &mut GrayImage, x0: u32, y0: u32, w: u32, h: u32) {
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.put_pixel(x, y, Luma([0]));
            }
        }
    }

    #[test]
    fn blank_raster_has_no_regions() {
        assert!(extract_regions(&canvas(), Polarity::Addition, &DiffConfig::default()).is_empty());
    }

    #[test]
    fn filled_rectangle_is_one_region() {
        let mut img = canvas();
        fill(&mut img, 10, 20, 30, 15);
        let regions = extract_regions(&img, Polarity::Deletion, &DiffConfig::default());
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert_eq!(r.label, "deletion-1");
        assert_eq!((r.x_min, r.x_max, r.y_min, r.y_max), (10, 39, 20, 34));
        assert!(r.description.starts_with("Removed content, 450 px"));
    }

    #[test]
    fn speckle_is_removed_by_opening() {
        let mut img = canvas();
        for i in 0..20 {
            img.put_pixel(5 + i * 4, 50, Luma([0]));
        }
        fill(&mut img, 60, 60, 2, 40);
        assert!(extract_regions(&img, Polarity::Addition, &DiffConfig::default()).is_empty());
    }

    #[test]
    fn small_components_are_dropped() {
        let mut img = canvas();
        fill(&mut img, 10, 10, 10, 10);
        assert!(extract_regions(&img, Polarity::Addition, &DiffConfig::default()).is_empty());
        fill(&mut img, 10, 10, 11, 11);
        assert_eq!(extract_regions(&img, Polarity::Addition, &DiffConfig::default()).len(), 1);
    }

    #[test]
    fn diagonal_touch_is_connected() {
        let mut img = canvas();
        fill(&mut img, 10, 10, 12, 12);
        fill(&mut img, 22, 22, 12, 12);
        let cfg = DiffConfig {
            opening_kernel: 1,
            ..Default::default()
        };
        let regions = extract_regions(&img, Polarity::Addition, &cfg);
        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].x_min, regions[0].x_max), (10, 33));
    }

    #[test]
    fn regions_are_ordered_and_numbered() {
        let mut img = canvas();
        fill(&mut img, 60, 60, 15, 15);
        fill(&mut img, 5, 5, 15, 15);
        let regions = extract_regions(&img, Polarity::Addition, &DiffConfig::default());
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].label, "addition-1");
        assert_eq!(regions[0].x_min, 5);
        assert_eq!(regions[1].label, "addition-2");
    }
}
