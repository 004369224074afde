//! Nearest-neighbour descriptor matching with Lowe's ratio test.

use crate::features::Keypoint;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    pub query: usize,
    pub train: usize,
    pub distance: f32,
}

/// Match each `query` keypoint against `train`.
///
/// A match is kept only when `best < ratio * second_best`. With fewer
/// than two train keypoints nothing can pass the test.
pub fn ratio_match(query: &[Keypoint], train: &[Keypoint], ratio: f64) -> Vec<FeatureMatch> {
    if train.len() < 2 {
        return Vec::new();
    }
    let ratio_sq = (ratio * ratio) as f32;
    let mut matches = Vec::new();

    for (qi, q) in query.iter().enumerate() {
        let mut best = (usize::MAX, f32::INFINITY);
        let mut second = f32::INFINITY;
        for (ti, t) in train.iter().enumerate() {
            let d = squared_distance(&q.descriptor, &t.descriptor);
            if d < best.1 {
                second = best.1;
                best = (ti, d);
            } else if d < second {
                second = d;
            }
        }
        if best.0 != usize::MAX && best.1 < ratio_sq * second {
            matches.push(FeatureMatch {
                query: qi,
                train: best.0,
                distance: best.1.sqrt(),
            });
        }
    }
    matches
}

#[inline]
fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
