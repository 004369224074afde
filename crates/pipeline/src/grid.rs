//! Stage A: coarse alignment from structural grid callouts.
//!
//! Grid bubbles carry numeric labels for vertical lines (positioned along
//! x) and alphabetic labels for horizontal lines (positioned along y).
//! Lines are matched between two sheets by label, falling back to
//! ordinal order, and a similarity is fitted to the matched line
//! intersections.

use std::collections::BTreeMap;

use async_trait::async_trait;
use image::GrayImage;
use plandiff_core::models::BoundingBox;
use plandiff_core::usage::UsageAccumulator;

use crate::config::MIN_GRID_MATCHES_PER_AXIS;
use crate::error::VisionError;
use crate::transform::{fit_similarity, Point, Similarity};

// ---------------------------------------------------------------------------
// Detector collaborator
// ---------------------------------------------------------------------------

/// External inference service that locates grid callouts on a raster.
#[async_trait]
pub trait CalloutDetector: Send + Sync {
    /// Detect labelled callout boxes. Token usage reported by the service
    /// is recorded on `usage`.
    async fn detect_callouts(
        &self,
        image: &GrayImage,
        usage: &mut UsageAccumulator,
    ) -> Result<Vec<BoundingBox>, VisionError>;
}

/// Detector used when no inference service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCalloutDetector;

#[async_trait]
impl CalloutDetector for NoCalloutDetector {
    async fn detect_callouts(
        &self,
        _image: &GrayImage,
        _usage: &mut UsageAccumulator,
    ) -> Result<Vec<BoundingBox>, VisionError> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Grid lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Numbered lines; position is an x coordinate.
    Vertical,
    /// Lettered lines; position is a y coordinate.
    Horizontal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridLine {
    pub label: String,
    pub position: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridLines {
    pub vertical: Vec<GridLine>,
    pub horizontal: Vec<GridLine>,
}

/// Canonical label: alphanumerics only, upper-cased.
pub fn normalize_label(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub fn classify(label: &str) -> Option<Axis> {
    match label.chars().next() {
        Some(c) if c.is_ascii_digit() => Some(Axis::Vertical),
        Some(c) if c.is_ascii_alphabetic() => Some(Axis::Horizontal),
        _ => None,
    }
}

/// Collapse callouts into one line per label, positioned at the mean
/// centroid of its bubbles, sorted by position.
pub fn grid_lines(callouts: &[BoundingBox]) -> GridLines {
    let mut vertical: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    let mut horizontal: BTreeMap<String, (f64, usize)> = BTreeMap::new();

    for callout in callouts {
        let label = normalize_label(&callout.label);
        let (cx, cy) = callout.centroid();
        let (map, pos) = match classify(&label) {
            Some(Axis::Vertical) => (&mut vertical, cx),
            Some(Axis::Horizontal) => (&mut horizontal, cy),
            None => continue,
        };
        if !pos.is_finite() {
            continue;
        }
        let entry = map.entry(label).or_insert((0.0, 0));
        entry.0 += pos;
        entry.1 += 1;
    }

    let collect = |map: BTreeMap<String, (f64, usize)>| {
        let mut lines: Vec<GridLine> = map
            .into_iter()
            .map(|(label, (sum, n))| GridLine {
                label,
                position: sum / n as f64,
            })
            .collect();
        lines.sort_by(|a, b| a.position.total_cmp(&b.position));
        lines
    };

    GridLines {
        vertical: collect(vertical),
        horizontal: collect(horizontal),
    }
}

/// Pair lines of `new` with lines of `old` as `(new_pos, old_pos)`.
///
/// Label matches win; when fewer than two labels agree and both sides
/// have the same number of lines, lines are paired by ordinal position.
pub fn match_lines(new: &[GridLine], old: &[GridLine]) -> Vec<(f64, f64)> {
    let by_label: Vec<(f64, f64)> = new
        .iter()
        .filter_map(|n| {
            old.iter()
                .find(|o| o.label == n.label)
                .map(|o| (n.position, o.position))
        })
        .collect();
    if by_label.len() >= MIN_GRID_MATCHES_PER_AXIS {
        return by_label;
    }
    if new.len() == old.len() && new.len() >= MIN_GRID_MATCHES_PER_AXIS {
        return new
            .iter()
            .zip(old)
            .map(|(n, o)| (n.position, o.position))
            .collect();
    }
    by_label
}

// ---------------------------------------------------------------------------
// Prior
// ---------------------------------------------------------------------------

/// Coarse new-to-old transform derived from grid intersections.
#[derive(Debug, Clone, PartialEq)]
pub struct GridPrior {
    pub transform: Similarity,
    pub vertical_matches: usize,
    pub horizontal_matches: usize,
}

/// Fit a prior from the callouts of both rasters.
///
/// Returns `None` when either axis has fewer than two matched lines, in
/// which case alignment proceeds without a prior.
pub fn grid_prior(new_callouts: &[BoundingBox], old_callouts: &[BoundingBox]) -> Option<GridPrior> {
    let new_lines = grid_lines(new_callouts);
    let old_lines = grid_lines(old_callouts);
    let xs = match_lines(&new_lines.vertical, &old_lines.vertical);
    let ys = match_lines(&new_lines.horizontal, &old_lines.horizontal);
    if xs.len() < MIN_GRID_MATCHES_PER_AXIS || ys.len() < MIN_GRID_MATCHES_PER_AXIS {
        tracing::debug!(
            vertical = xs.len(),
            horizontal = ys.len(),
            "Too few grid matches, skipping grid prior"
        );
        return None;
    }

    let mut src: Vec<Point> = Vec::with_capacity(xs.len() * ys.len());
    let mut dst: Vec<Point> = Vec::with_capacity(xs.len() * ys.len());
    for &(xn, xo) in &xs {
        for &(yn, yo) in &ys {
            src.push((xn, yn));
            dst.push((xo, yo));
        }
    }
    let transform = fit_similarity(&src, &dst)?;
    Some(GridPrior {
        transform,
        vertical_matches: xs.len(),
        horizontal_matches: ys.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bubble(label: &str, cx: f64, cy: f64) -> BoundingBox {
        BoundingBox {
            label: label.to_string(),
            x_min: cx - 10.0,
            y_min: cy - 10.0,
            x_max: cx + 10.0,
            y_max: cy + 10.0,
        }
    }

    fn sheet(offset: (f64, f64), scale: f64) -> Vec<BoundingBox> {
        let mut out = Vec::new();
        for (i, label) in ["1", "2", "3"].iter().enumerate() {
            let x = offset.0 + scale * (100.0 + 200.0 * i as f64);
            out.push(bubble(label, x, offset.1 + scale * 20.0));
            out.push(bubble(label, x, offset.1 + scale * 780.0));
        }
        for (i, label) in ["A", "B"].iter().enumerate() {
            let y = offset.1 + scale * (150.0 + 300.0 * i as f64);
            out.push(bubble(label, offset.0 + scale * 20.0, y));
        }
        out
    }

    #[test]
    fn labels_are_normalised_and_classified() {
        assert_eq!(normalize_label(" a.1 "), "A1");
        assert_eq!(classify("12"), Some(Axis::Vertical));
        assert_eq!(classify("C"), Some(Axis::Horizontal));
        assert_eq!(classify(""), None);
    }

    #[test]
    fn duplicate_bubbles_average_into_one_line() {
        let lines = grid_lines(&sheet((0.0, 0.0), 1.0));
        assert_eq!(lines.vertical.len(), 3);
        assert_eq!(lines.horizontal.len(), 2);
        assert_eq!(lines.vertical[0].position, 100.0);
        assert_eq!(lines.horizontal[1].label, "B");
        assert_eq!(lines.horizontal[1].position, 450.0);
    }

    #[test]
    fn prior_recovers_offset_and_scale() {
        let prior = grid_prior(&sheet((40.0, -25.0), 1.1), &sheet((0.0, 0.0), 1.0)).unwrap();
        assert_eq!(prior.vertical_matches, 3);
        assert_eq!(prior.horizontal_matches, 2);
        let (x, y) = prior.transform.apply(40.0 + 1.1 * 300.0, -25.0 + 1.1 * 450.0);
        assert!((x - 300.0).abs() < 1e-6);
        assert!((y - 450.0).abs() < 1e-6);
    }

    #[test]
    fn ordinal_fallback_when_labels_differ() {
        let new = vec![
            GridLine { label: "1".into(), position: 10.0 },
            GridLine { label: "2".into(), position: 50.0 },
        ];
        let old = vec![
            GridLine { label: "7".into(), position: 12.0 },
            GridLine { label: "8".into(), position: 52.0 },
        ];
        assert_eq!(match_lines(&new, &old), vec![(10.0, 12.0), (50.0, 52.0)]);
    }

    #[test]
    fn single_line_axis_skips_prior() {
        let new = vec![bubble("1", 100.0, 10.0), bubble("2", 300.0, 10.0), bubble("A", 10.0, 100.0)];
        assert!(grid_prior(&new, &new).is_none());
    }

    #[tokio::test]
    async fn no_detector_returns_nothing() {
        let mut usage = UsageAccumulator::new();
        let img = GrayImage::new(4, 4);
        let found = NoCalloutDetector.detect_callouts(&img, &mut usage).await.unwrap();
        assert!(found.is_empty());
        assert!(usage.is_empty());
    }
}
