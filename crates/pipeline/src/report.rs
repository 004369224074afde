//! Human-readable change and clash reports.

use plandiff_core::models::{OverlayReport, Region, ReportKind};
use plandiff_core::types::{EntityId, Timestamp};

pub const NO_CHANGES: &str = "No changes detected between the compared revisions.";
pub const NO_CLASHES: &str = "No potential clashes detected.";

/// Summarise addition and deletion regions.
pub fn change_report(
    job_id: &EntityId,
    additions: &[Region],
    deletions: &[Region],
    created_at: Timestamp,
) -> OverlayReport {
    let summary = if additions.is_empty() && deletions.is_empty() {
        NO_CHANGES.to_string()
    } else {
        format!(
            "Detected {} and {}. Review clustered regions together as a single \
             revision and confirm isolated regions individually.",
            plural(additions.len(), "addition region"),
            plural(deletions.len(), "deletion region"),
        )
    };
    let regions = additions.iter().chain(deletions).cloned().collect();
    OverlayReport {
        kind: ReportKind::Change,
        job_id: job_id.clone(),
        summary,
        regions,
        created_at,
    }
}

/// Every region, whatever its polarity, is a clash candidate.
pub fn clash_report(
    job_id: &EntityId,
    additions: &[Region],
    deletions: &[Region],
    created_at: Timestamp,
) -> OverlayReport {
    let regions: Vec<Region> = additions
        .iter()
        .chain(deletions)
        .enumerate()
        .map(|(i, r)| Region {
            label: format!("clash-{}", i + 1),
            description: format!("Potential clash ({})", r.description),
            ..r.clone()
        })
        .collect();
    let summary = if regions.is_empty() {
        NO_CLASHES.to_string()
    } else {
        format!(
            "Detected {} across added and removed content.",
            plural(regions.len(), "potential clash")
        )
    };
    OverlayReport {
        kind: ReportKind::Clash,
        job_id: job_id.clone(),
        summary,
        regions,
        created_at,
    }
}

fn plural(n: usize, noun: &str) -> String {
    match (n, noun.ends_with("sh")) {
        (1, _) => format!("1 {noun}"),
        (_, true) => format!("{n} {noun}es"),
        _ => format!("{n} {noun}s"),
    }
}
