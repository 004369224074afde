//! Scale-invariant keypoints and 128-d gradient-histogram descriptors.
//!
//! A compact difference-of-Gaussians detector: Gaussian scale space per
//! octave, 3D extrema of the DoG stack, low-contrast and edge-response
//! rejection, a dominant orientation per keypoint and a 4x4x8 descriptor
//! sampled in the rotated keypoint frame.

use std::f32::consts::PI;

use image::GrayImage;

use crate::raster::FloatImage;

const SCALES_PER_OCTAVE: usize = 3;
const BASE_SIGMA: f32 = 1.6;
const ASSUMED_BLUR: f32 = 0.5;
const MAX_OCTAVES: usize = 5;
const MIN_OCTAVE_SIZE: usize = 32;
const CONTRAST_THRESHOLD: f32 = 0.02;
const EDGE_RATIO: f32 = 10.0;
const BORDER: usize = 8;
const ORIENTATION_BINS: usize = 36;
const DESCRIPTOR_CELLS: usize = 4;
const DESCRIPTOR_BINS: usize = 8;
pub const DESCRIPTOR_LEN: usize = DESCRIPTOR_CELLS * DESCRIPTOR_CELLS * DESCRIPTOR_BINS;

#[derive(Debug, Clone)]
pub struct Keypoint {
    /// Position in the coordinates of the image passed to [`detect`].
    pub x: f64,
    pub y: f64,
    /// Absolute scale of the detection.
    pub sigma: f32,
    /// Dominant gradient direction in radians.
    pub orientation: f32,
    /// |DoG| at the extremum; used to keep the strongest features.
    pub response: f32,
    pub descriptor: [f32; DESCRIPTOR_LEN],
}

/// Detection window and feature cap.
#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    pub max_features: usize,
    /// Fraction of each edge excluded from detection.
    pub margin_fraction: f64,
}

struct Candidate {
    octave: usize,
    layer: usize,
    x: usize,
    y: usize,
    response: f32,
}

struct Octave {
    gaussians: Vec<FloatImage>,
    dogs: Vec<FloatImage>,
    sigmas: Vec<f32>,
}

/// Detect keypoints and compute descriptors, strongest first.
pub fn detect(img: &GrayImage, params: DetectorParams) -> Vec<Keypoint> {
    if img.width() < MIN_OCTAVE_SIZE as u32 || img.height() < MIN_OCTAVE_SIZE as u32 {
        return Vec::new();
    }
    let octaves = build_scale_space(img);

    let (w, h) = (img.width() as f64, img.height() as f64);
    let margin = params.margin_fraction.clamp(0.0, 0.49);
    let (x_lo, x_hi) = (w * margin, w * (1.0 - margin));
    let (y_lo, y_hi) = (h * margin, h * (1.0 - margin));

    let mut candidates = Vec::new();
    for (o, octave) in octaves.iter().enumerate() {
        let step = (1usize << o) as f64;
        for layer in 1..octave.dogs.len() - 1 {
            find_extrema(octave, o, layer, &mut candidates);
        }
        candidates.retain(|c: &Candidate| {
            if c.octave != o {
                return true;
            }
            let (x, y) = (c.x as f64 * step, c.y as f64 * step);
            x >= x_lo && x < x_hi && y >= y_lo && y < y_hi
        });
    }

    candidates.sort_by(|a, b| b.response.total_cmp(&a.response));
    candidates.truncate(params.max_features);

    candidates
        .iter()
        .map(|c| {
            let octave = &octaves[c.octave];
            let g = &octave.gaussians[c.layer];
            let local_sigma = octave.sigmas[c.layer];
            let orientation = dominant_orientation(g, c.x, c.y, local_sigma);
            let descriptor = describe(g, c.x, c.y, local_sigma, orientation);
            let step = (1usize << c.octave) as f64;
            Keypoint {
                x: c.x as f64 * step,
                y: c.y as f64 * step,
                sigma: local_sigma * step as f32,
                orientation,
                response: c.response,
                descriptor,
            }
        })
        .collect()
}

fn build_scale_space(img: &GrayImage) -> Vec<Octave> {
    let k = 2f32.powf(1.0 / SCALES_PER_OCTAVE as f32);
    let layers = SCALES_PER_OCTAVE + 3;
    let sigmas: Vec<f32> = (0..layers).map(|i| BASE_SIGMA * k.powi(i as i32)).collect();

    let mut base = FloatImage::from_gray(img)
        .blur((BASE_SIGMA * BASE_SIGMA - ASSUMED_BLUR * ASSUMED_BLUR).sqrt());
    let mut octaves = Vec::new();

    for _ in 0..MAX_OCTAVES {
        if base.width < MIN_OCTAVE_SIZE || base.height < MIN_OCTAVE_SIZE {
            break;
        }
        let mut gaussians = Vec::with_capacity(layers);
        gaussians.push(base.clone());
        for i in 1..layers {
            let inc = (sigmas[i] * sigmas[i] - sigmas[i - 1] * sigmas[i - 1]).sqrt();
            let next = gaussians[i - 1].blur(inc);
            gaussians.push(next);
        }
        let dogs = gaussians
            .windows(2)
            .map(|pair| pair[1].subtract(&pair[0]))
            .collect();
        // Layer SCALES_PER_OCTAVE has twice the base sigma.
        base = gaussians[SCALES_PER_OCTAVE].half();
        octaves.push(Octave {
            gaussians,
            dogs,
            sigmas: sigmas.clone(),
        });
    }
    octaves
}

fn find_extrema(octave: &Octave, o: usize, layer: usize, out: &mut Vec<Candidate>) {
    let dog = &octave.dogs[layer];
    let below = &octave.dogs[layer - 1];
    let above = &octave.dogs[layer + 1];
    if dog.width <= 2 * BORDER || dog.height <= 2 * BORDER {
        return;
    }
    for y in BORDER..dog.height - BORDER {
        for x in BORDER..dog.width - BORDER {
            let v = dog.at(x, y);
            if v.abs() < CONTRAST_THRESHOLD {
                continue;
            }
            if !is_extremum(v, x, y, [below, dog, above]) {
                continue;
            }
            if is_edge(dog, x, y) {
                continue;
            }
            out.push(Candidate {
                octave: o,
                layer,
                x,
                y,
                response: v.abs(),
            });
        }
    }
}

fn is_extremum(v: f32, x: usize, y: usize, stack: [&FloatImage; 3]) -> bool {
    let is_max = v > 0.0;
    for (s, img) in stack.iter().enumerate() {
        for dy in -1isize..=1 {
            for dx in -1isize..=1 {
                if s == 1 && dx == 0 && dy == 0 {
                    continue;
                }
                let n = img.at((x as isize + dx) as usize, (y as isize + dy) as usize);
                if (is_max && n >= v) || (!is_max && n <= v) {
                    return false;
                }
            }
        }
    }
    true
}

fn is_edge(dog: &FloatImage, x: usize, y: usize) -> bool {
    let c = dog.at(x, y);
    let dxx = dog.at(x + 1, y) + dog.at(x - 1, y) - 2.0 * c;
    let dyy = dog.at(x, y + 1) + dog.at(x, y - 1) - 2.0 * c;
    let dxy = (dog.at(x + 1, y + 1) - dog.at(x - 1, y + 1) - dog.at(x + 1, y - 1)
        + dog.at(x - 1, y - 1))
        / 4.0;
    let trace = dxx + dyy;
    let det = dxx * dyy - dxy * dxy;
    if det <= 0.0 {
        return true;
    }
    trace * trace / det >= (EDGE_RATIO + 1.0).powi(2) / EDGE_RATIO
}

#[inline]
fn gradient(img: &FloatImage, x: isize, y: isize) -> (f32, f32) {
    let dx = img.at_clamped(x + 1, y) - img.at_clamped(x - 1, y);
    let dy = img.at_clamped(x, y + 1) - img.at_clamped(x, y - 1);
    ((dx * dx + dy * dy).sqrt(), dy.atan2(dx))
}

fn dominant_orientation(img: &FloatImage, x: usize, y: usize, sigma: f32) -> f32 {
    let weight_sigma = 1.5 * sigma;
    let radius = (3.0 * weight_sigma).round() as isize;
    let mut hist = [0f32; ORIENTATION_BINS];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let (mag, angle) = gradient(img, x as isize + dx, y as isize + dy);
            let weight = (-((dx * dx + dy * dy) as f32) / (2.0 * weight_sigma * weight_sigma)).exp();
            let bin = (((angle + PI) / (2.0 * PI)) * ORIENTATION_BINS as f32) as usize % ORIENTATION_BINS;
            hist[bin] += mag * weight;
        }
    }

    // Smooth once so single-bin spikes do not dominate.
    let smoothed: Vec<f32> = (0..ORIENTATION_BINS)
        .map(|i| {
            let prev = hist[(i + ORIENTATION_BINS - 1) % ORIENTATION_BINS];
            let next = hist[(i + 1) % ORIENTATION_BINS];
            0.25 * prev + 0.5 * hist[i] + 0.25 * next
        })
        .collect();

    let (peak, _) = smoothed
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });

    // Parabolic interpolation of the peak position.
    let l = smoothed[(peak + ORIENTATION_BINS - 1) % ORIENTATION_BINS];
    let c = smoothed[peak];
    let r = smoothed[(peak + 1) % ORIENTATION_BINS];
    let denom = l - 2.0 * c + r;
    let offset = if denom.abs() > f32::EPSILON { 0.5 * (l - r) / denom } else { 0.0 };
    let bin = peak as f32 + 0.5 + offset;
    bin / ORIENTATION_BINS as f32 * 2.0 * PI - PI
}

fn describe(img: &FloatImage, x: usize, y: usize, sigma: f32, orientation: f32) -> [f32; DESCRIPTOR_LEN] {
    let mut desc = [0f32; DESCRIPTOR_LEN];
    let cell = 3.0 * sigma;
    let half_width = cell * DESCRIPTOR_CELLS as f32 / 2.0;
    let radius = (half_width * std::f32::consts::SQRT_2).ceil() as isize;
    let (sin_o, cos_o) = orientation.sin_cos();
    let weight_sigma = half_width;

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            // Rotate the offset into the keypoint frame.
            let rx = (cos_o * dx as f32 + sin_o * dy as f32) / cell;
            let ry = (-sin_o * dx as f32 + cos_o * dy as f32) / cell;
            let cx = rx + DESCRIPTOR_CELLS as f32 / 2.0 - 0.5;
            let cy = ry + DESCRIPTOR_CELLS as f32 / 2.0 - 0.5;
            if cx <= -1.0 || cy <= -1.0 || cx >= DESCRIPTOR_CELLS as f32 || cy >= DESCRIPTOR_CELLS as f32 {
                continue;
            }

            let (mag, angle) = gradient(img, x as isize + dx, y as isize + dy);
            if mag == 0.0 {
                continue;
            }
            let weight = (-((dx * dx + dy * dy) as f32) / (2.0 * weight_sigma * weight_sigma)).exp();
            let mut rel = angle - orientation;
            while rel < 0.0 {
                rel += 2.0 * PI;
            }
            while rel >= 2.0 * PI {
                rel -= 2.0 * PI;
            }
            let ob = rel / (2.0 * PI) * DESCRIPTOR_BINS as f32;

            // Trilinear distribution over neighbouring cells and bins.
            let (x0, y0, o0) = (cx.floor(), cy.floor(), ob.floor());
            let (fx, fy, fo) = (cx - x0, cy - y0, ob - o0);
            for (iy, wy) in [(y0 as isize, 1.0 - fy), (y0 as isize + 1, fy)] {
                if iy < 0 || iy >= DESCRIPTOR_CELLS as isize {
                    continue;
                }
                for (ix, wx) in [(x0 as isize, 1.0 - fx), (x0 as isize + 1, fx)] {
                    if ix < 0 || ix >= DESCRIPTOR_CELLS as isize {
                        continue;
                    }
                    for (io, wo) in [(o0 as usize, 1.0 - fo), (o0 as usize + 1, fo)] {
                        let bin = io % DESCRIPTOR_BINS;
                        let idx = (iy as usize * DESCRIPTOR_CELLS + ix as usize) * DESCRIPTOR_BINS + bin;
                        desc[idx] += mag * weight * wx * wy * wo;
                    }
                }
            }
        }
    }

    normalize(&mut desc);
    for v in desc.iter_mut() {
        *v = v.min(0.2);
    }
    normalize(&mut desc);
    desc
}

fn normalize(desc: &mut [f32; DESCRIPTOR_LEN]) {
    let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in desc.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn params() -> DetectorParams {
        DetectorParams {
            max_features: 500,
            margin_fraction: 0.0,
        }
    }

    fn squares() -> GrayImage {
        let mut img = GrayImage::from_pixel(160, 160, Luma([255]));
        for (ox, oy, size) in [(30u32, 30u32, 20u32), (90, 40, 30), (50, 100, 25)] {
            for y in oy..oy + size {
                for x in ox..ox + size {
                    img.put_pixel(x, y, Luma([0]));
                }
            }
        }
        img
    }

    #[test]
    fn blank_image_has_no_keypoints() {
        let img = GrayImage::from_pixel(128, 128, Luma([255]));
        assert!(detect(&img, params()).is_empty());
    }

    #[test]
    fn tiny_image_has_no_keypoints() {
        let img = GrayImage::from_pixel(10, 10, Luma([0]));
        assert!(detect(&img, params()).is_empty());
    }

    #[test]
    fn squares_produce_normalised_descriptors() {
        let kps = detect(&squares(), params());
        assert!(!kps.is_empty());
        for kp in &kps {
            let norm: f32 = kp.descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-3 || norm == 0.0);
        }
        // strongest first
        assert!(kps.windows(2).all(|w| w[0].response >= w[1].response));
    }

    #[test]
    fn feature_cap_is_respected() {
        let kps = detect(
            &squares(),
            DetectorParams {
                max_features: 3,
                margin_fraction: 0.0,
            },
        );
        assert!(kps.len() <= 3);
    }

    #[test]
    fn margin_excludes_border_features() {
        let margin = 0.3;
        let kps = detect(
            &squares(),
            DetectorParams {
                max_features: 500,
                margin_fraction: margin,
            },
        );
        for kp in kps {
            assert!(kp.x >= 160.0 * margin && kp.x < 160.0 * (1.0 - margin));
            assert!(kp.y >= 160.0 * margin && kp.y < 160.0 * (1.0 - margin));
        }
    }
}
