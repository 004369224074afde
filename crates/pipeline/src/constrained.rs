//! Least-squares similarity fitting under box constraints on scale and
//! rotation.
//!
//! With centred points `p'`, `q'` and translation eliminated, the cost is
//!
//! ```text
//! E(s, θ) = s²·P − 2s·C(θ) + Q,   C(θ) = A·cos θ + B·sin θ
//! ```
//!
//! For any positive `s` the cost decreases as `C(θ)` grows, so the optimal
//! angle is the point of the rotation interval closest to `atan2(B, A)`,
//! and the optimal scale is `C(θ)/P` clamped to the scale interval.

use crate::transform::{centroid, Point, Similarity};

#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub scale_min: f64,
    pub scale_max: f64,
    pub rotation_min_deg: f64,
    pub rotation_max_deg: f64,
}

/// A bounded fit together with the scale and rotation it settled on.
///
/// `scale` and `rotation_degrees` are the values chosen inside the bounds;
/// re-deriving them from `transform` can land a rounding step outside.
#[derive(Debug, Clone, Copy)]
pub struct BoundedFit {
    pub transform: Similarity,
    pub scale: f64,
    pub rotation_degrees: f64,
}

/// Bounded least-squares fit over all pairs.
pub fn fit_bounded(src: &[Point], dst: &[Point], bounds: &Bounds) -> Option<BoundedFit> {
    let n = src.len().min(dst.len());
    if n < 2 {
        return None;
    }
    let (msx, msy) = centroid(&src[..n]);
    let (mdx, mdy) = centroid(&dst[..n]);

    let (mut p, mut a, mut b) = (0.0, 0.0, 0.0);
    for (s, d) in src[..n].iter().zip(&dst[..n]) {
        let (px, py) = (s.0 - msx, s.1 - msy);
        let (qx, qy) = (d.0 - mdx, d.1 - mdy);
        p += px * px + py * py;
        a += px * qx + py * qy;
        b += px * qy - py * qx;
    }
    if p < 1e-9 {
        return None;
    }

    let degrees = closest_angle(
        b.atan2(a).to_degrees(),
        bounds.rotation_min_deg,
        bounds.rotation_max_deg,
    );
    let theta = degrees.to_radians();
    let c = a * theta.cos() + b * theta.sin();
    let scale = (c / p).clamp(bounds.scale_min, bounds.scale_max);

    let (sin_t, cos_t) = theta.sin_cos();
    let (ra, rb) = (scale * cos_t, scale * sin_t);
    let transform = Similarity {
        a: ra,
        b: rb,
        tx: mdx - (ra * msx - rb * msy),
        ty: mdy - (rb * msx + ra * msy),
    };
    transform.is_finite().then_some(BoundedFit {
        transform,
        scale,
        rotation_degrees: degrees,
    })
}

/// Bounded fit with iterative inlier reselection.
///
/// Starts from `seed_inliers` (all pairs when fewer than two are given),
/// refits, and reselects pairs within `threshold` until the set is stable.
/// The returned inliers are always the consensus of the returned fit.
pub fn refine_bounded(
    src: &[Point],
    dst: &[Point],
    seed_inliers: &[usize],
    bounds: &Bounds,
    threshold: f64,
) -> Option<(BoundedFit, Vec<usize>)> {
    let n = src.len().min(dst.len());
    let mut inliers: Vec<usize> = if seed_inliers.len() >= 2 {
        seed_inliers.to_vec()
    } else {
        (0..n).collect()
    };
    let mut current: Option<(BoundedFit, Vec<usize>)> = None;

    for _ in 0..8 {
        let s: Vec<Point> = inliers.iter().map(|&i| src[i]).collect();
        let d: Vec<Point> = inliers.iter().map(|&i| dst[i]).collect();
        let Some(fit) = fit_bounded(&s, &d, bounds) else {
            break;
        };
        let next: Vec<usize> = (0..n)
            .filter(|&i| fit.transform.reprojection_error(src[i], dst[i]) <= threshold)
            .collect();
        if next.len() < 2 {
            // Keep the previous round; its set cannot seed another refit.
            return current.or(Some((fit, next)));
        }
        let stable = next == inliers;
        current = Some((fit, next.clone()));
        if stable {
            break;
        }
        inliers = next;
    }
    current
}

/// Point of `[lo, hi]` nearest to `target` on the circle, in degrees.
fn closest_angle(target: f64, lo: f64, hi: f64) -> f64 {
    let in_range = |t: f64| t >= lo && t <= hi;
    for k in [-1.0, 0.0, 1.0] {
        let t = target + k * 360.0;
        if in_range(t) {
            return t;
        }
    }
    if angular_distance(target, lo) <= angular_distance(target, hi) {
        lo
    } else {
        hi
    }
}

fn angular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> Bounds {
        Bounds {
            scale_min: 0.3,
            scale_max: 3.0,
            rotation_min_deg: -30.0,
            rotation_max_deg: 30.0,
        }
    }

    fn square() -> Vec<Point> {
        vec![(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0), (50.0, 30.0)]
    }

    #[test]
    fn in_bounds_fit_is_exact() {
        let truth = Similarity::from_params(1.4, 10.0, 5.0, -2.0);
        let src = square();
        let dst: Vec<Point> = src.iter().map(|p| truth.apply(p.0, p.1)).collect();
        let fit = fit_bounded(&src, &dst, &bounds()).unwrap();
        assert!((fit.transform.scale() - 1.4).abs() < 1e-9);
        assert!((fit.rotation_degrees - 10.0).abs() < 1e-9);
    }

    #[test]
    fn rotation_is_clamped() {
        let truth = Similarity::from_params(1.0, 45.0, 0.0, 0.0);
        let src = square();
        let dst: Vec<Point> = src.iter().map(|p| truth.apply(p.0, p.1)).collect();
        let fit = fit_bounded(&src, &dst, &bounds()).unwrap();
        assert_eq!(fit.rotation_degrees, 30.0);
        assert!((fit.transform.rotation_degrees() - 30.0).abs() < 1e-9);
        // scale shrinks by cos(15°) when the angle is pinned
        assert!((fit.scale - 15f64.to_radians().cos()).abs() < 1e-9);
    }

    #[test]
    fn scale_is_clamped() {
        let truth = Similarity::from_params(5.0, -5.0, 0.0, 0.0);
        let src = square();
        let dst: Vec<Point> = src.iter().map(|p| truth.apply(p.0, p.1)).collect();
        let fit = fit_bounded(&src, &dst, &bounds()).unwrap();
        assert_eq!(fit.scale, 3.0);
        assert!((fit.transform.scale() - 3.0).abs() < 1e-9);
        assert!((fit.rotation_degrees + 5.0).abs() < 1e-9);
    }

    #[test]
    fn opposite_rotation_picks_nearest_bound() {
        assert_eq!(closest_angle(170.0, -30.0, 30.0), 30.0);
        assert_eq!(closest_angle(-170.0, -30.0, 30.0), -30.0);
        assert_eq!(closest_angle(350.0, -30.0, 30.0), -10.0);
    }

    #[test]
    fn refine_drops_outliers() {
        let truth = Similarity::from_params(1.0, 5.0, 10.0, 10.0);
        let mut src = square();
        src.push((70.0, 70.0));
        let mut dst: Vec<Point> = src.iter().map(|p| truth.apply(p.0, p.1)).collect();
        dst[5] = (500.0, -500.0);
        let (fit, inliers) = refine_bounded(&src, &dst, &[0, 1, 2, 3, 4], &bounds(), 3.0).unwrap();
        assert_eq!(inliers, vec![0, 1, 2, 3, 4]);
        assert!((fit.rotation_degrees - 5.0).abs() < 1e-9);
    }

    #[test]
    fn refined_inliers_are_the_consensus_of_the_refined_fit() {
        // Far outside the scale box: the clamped fit only explains the pair
        // sitting on the centroid.
        let truth = Similarity::from_params(6.0, 0.0, 0.0, 0.0);
        let src: Vec<Point> = (0..25)
            .map(|i| ((i % 5) as f64 * 40.0, (i / 5) as f64 * 40.0))
            .collect();
        let dst: Vec<Point> = src.iter().map(|p| truth.apply(p.0, p.1)).collect();
        let all: Vec<usize> = (0..src.len()).collect();

        let (fit, inliers) = refine_bounded(&src, &dst, &all, &bounds(), 15.0).unwrap();

        let consensus: Vec<usize> = all
            .iter()
            .copied()
            .filter(|&i| fit.transform.reprojection_error(src[i], dst[i]) <= 15.0)
            .collect();
        assert_eq!(inliers, consensus);
        assert_eq!(inliers, vec![12]);
        assert_eq!(fit.scale, 3.0);
    }
}
