//! Robust similarity estimation from noisy point correspondences.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::transform::{fit_similarity, Point, Similarity};

#[derive(Debug, Clone, Copy)]
pub struct RansacParams {
    /// Inlier threshold in pixels.
    pub threshold: f64,
    pub max_iters: usize,
    pub confidence: f64,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct RansacEstimate {
    pub transform: Similarity,
    /// Indices into the input slices.
    pub inliers: Vec<usize>,
}

/// Estimate the similarity mapping `src` onto `dst`.
///
/// Minimal samples are two correspondences. The iteration budget shrinks
/// adaptively as better consensus sets are found, and the winner is refit
/// by least squares on its inliers. Returns `None` when no sample yields
/// at least two inliers.
pub fn estimate(src: &[Point], dst: &[Point], params: &RansacParams) -> Option<RansacEstimate> {
    let n = src.len().min(dst.len());
    if n < 2 {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<RansacEstimate> = None;
    let mut budget = params.max_iters;
    let mut iter = 0;

    while iter < budget {
        iter += 1;
        let i = rng.random_range(0..n);
        let mut j = rng.random_range(0..n - 1);
        if j >= i {
            j += 1;
        }
        if too_close(src[i], src[j]) || too_close(dst[i], dst[j]) {
            continue;
        }
        let Some(candidate) = fit_similarity(&[src[i], src[j]], &[dst[i], dst[j]]) else {
            continue;
        };
        let inliers = inliers_of(&candidate, src, dst, params.threshold);
        let better = best
            .as_ref()
            .map_or(true, |b| inliers.len() > b.inliers.len());
        if better && inliers.len() >= 2 {
            budget = budget.min(adaptive_budget(inliers.len(), n, params.confidence, params.max_iters));
            best = Some(RansacEstimate {
                transform: candidate,
                inliers,
            });
        }
    }

    let best = best?;
    Some(refit(best, src, dst, params.threshold))
}

/// Indices whose reprojection error under `t` is within `threshold`.
pub fn inliers_of(t: &Similarity, src: &[Point], dst: &[Point], threshold: f64) -> Vec<usize> {
    src.iter()
        .zip(dst)
        .enumerate()
        .filter(|(_, (p, q))| t.reprojection_error(**p, **q) <= threshold)
        .map(|(i, _)| i)
        .collect()
}

fn refit(mut est: RansacEstimate, src: &[Point], dst: &[Point], threshold: f64) -> RansacEstimate {
    for _ in 0..2 {
        let s: Vec<Point> = est.inliers.iter().map(|&i| src[i]).collect();
        let d: Vec<Point> = est.inliers.iter().map(|&i| dst[i]).collect();
        let Some(t) = fit_similarity(&s, &d) else {
            break;
        };
        let inliers = inliers_of(&t, src, dst, threshold);
        if inliers.len() < est.inliers.len() {
            break;
        }
        est = RansacEstimate {
            transform: t,
            inliers,
        };
    }
    est
}

fn adaptive_budget(inliers: usize, total: usize, confidence: f64, max_iters: usize) -> usize {
    let w = inliers as f64 / total as f64;
    let p_good = w * w;
    if p_good >= 1.0 {
        return 1;
    }
    let needed = (1.0 - confidence).ln() / (1.0 - p_good).ln();
    if needed.is_finite() && needed > 0.0 {
        (needed.ceil() as usize).clamp(1, max_iters)
    } else {
        max_iters
    }
}

fn too_close(a: Point, b: Point) -> bool {
    (a.0 - b.0).hypot(a.1 - b.1) < 1e-6
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RansacParams {
        RansacParams {
            threshold: 2.0,
            max_iters: 2000,
            confidence: 0.99,
            seed: 7,
        }
    }

    fn grid(n: usize) -> Vec<Point> {
        (0..n)
            .map(|i| ((i % 10) as f64 * 23.0 + 5.0, (i / 10) as f64 * 17.0 + 3.0))
            .collect()
    }

    #[test]
    fn recovers_transform_with_outliers() {
        let truth = Similarity::from_params(1.1, 4.0, 12.0, -8.0);
        let src = grid(60);
        let mut dst: Vec<Point> = src.iter().map(|p| truth.apply(p.0, p.1)).collect();
        // 25% gross outliers
        for (k, i) in (0..60).step_by(4).enumerate() {
            dst[i] = (900.0 + k as f64 * 31.0, -400.0 + k as f64 * 7.0);
        }
        let est = estimate(&src, &dst, &params()).unwrap();
        assert_eq!(est.inliers.len(), 45);
        assert!((est.transform.scale() - 1.1).abs() < 1e-6);
        assert!((est.transform.rotation_degrees() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn same_seed_same_result() {
        let truth = Similarity::from_params(0.9, -3.0, 0.0, 5.0);
        let src = grid(30);
        let dst: Vec<Point> = src.iter().map(|p| truth.apply(p.0, p.1)).collect();
        let a = estimate(&src, &dst, &params()).unwrap();
        let b = estimate(&src, &dst, &params()).unwrap();
        assert_eq!(a.transform, b.transform);
        assert_eq!(a.inliers, b.inliers);
    }

    #[test]
    fn too_few_points() {
        assert!(estimate(&[(0.0, 0.0)], &[(1.0, 1.0)], &params()).is_none());
    }

    #[test]
    fn budget_shrinks_with_high_inlier_ratio() {
        assert!(adaptive_budget(90, 100, 0.95, 5000) < 10);
        assert_eq!(adaptive_budget(1, 1000, 0.95, 5000), 5000);
    }
}
