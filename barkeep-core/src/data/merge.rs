//! Reconciles a persisted series with newly fetched bars.
//!
//! The merged output always has strictly increasing timestamps:
//! - rows identical in every field collapse to one (last occurrence kept)
//! - remaining rows sharing a timestamp are conflicts; the highest volume
//!   wins and equal volumes prefer the later (incoming) row
//!
//! A sparse-history heuristic flags daily and weekly series that look like
//! they are missing large stretches. It is a diagnostic and never alters
//! the result.

use crate::domain::{Bar, Interval, Series};
use serde::{Deserialize, Serialize};

/// Minimum bar count before the gap heuristic is evaluated.
pub const GAP_MIN_BARS: usize = 20;
/// Share of calendar days expected to carry a bar.
pub const GAP_OCCUPANCY: f64 = 0.7;
/// Warn when the bar count falls below this share of the expectation.
pub const GAP_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Existing,
    Incoming,
}

/// Sparse-history diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GapWarning {
    pub bars: usize,
    pub span_days: i64,
    pub expected_bars: f64,
}

/// What a merge did, for logging by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub existing_rows: usize,
    pub incoming_rows: usize,
    pub merged_rows: usize,
    /// Stored rows re-delivered unchanged by the provider.
    pub overlap: usize,
    /// Identical rows removed that were not plain re-deliveries.
    pub exact_duplicates: usize,
    /// Rows dropped because another row with the same timestamp won.
    pub conflicts: usize,
    pub gap: Option<GapWarning>,
}

impl MergeReport {
    /// Rows in the merged series that were not there before.
    pub fn added(&self) -> usize {
        self.merged_rows.saturating_sub(self.existing_rows)
    }

    /// True when anything beyond plain overlap was cleaned up.
    pub fn had_cleanup(&self) -> bool {
        self.exact_duplicates > 0 || self.conflicts > 0
    }
}

/// Merge `incoming` into `existing` for a series sampled at `interval`.
pub fn merge(existing: &Series, incoming: &Series, interval: Interval) -> (Series, MergeReport) {
    let mut report = MergeReport {
        existing_rows: existing.len(),
        incoming_rows: incoming.len(),
        ..MergeReport::default()
    };

    let mut rows: Vec<(Bar, Origin)> = Vec::with_capacity(existing.len() + incoming.len());
    rows.extend(existing.bars.iter().map(|b| (*b, Origin::Existing)));
    rows.extend(incoming.bars.iter().map(|b| (*b, Origin::Incoming)));
    // Stable: equal timestamps keep existing-before-incoming order.
    rows.sort_by_key(|(bar, _)| bar.timestamp);

    let mut merged = Vec::with_capacity(rows.len());
    let mut start = 0;
    while start < rows.len() {
        let ts = rows[start].0.timestamp;
        let end = rows[start..]
            .iter()
            .position(|(bar, _)| bar.timestamp != ts)
            .map_or(rows.len(), |offset| start + offset);

        merged.push(reconcile(&rows[start..end], &mut report));
        start = end;
    }

    report.merged_rows = merged.len();
    let merged = Series::new(merged);
    if !existing.is_empty() {
        report.gap = detect_gap(&merged, interval);
    }
    (merged, report)
}

/// Collapse rows sharing one timestamp into the single surviving bar.
fn reconcile(group: &[(Bar, Origin)], report: &mut MergeReport) -> Bar {
    if let [(bar, _)] = group {
        return *bar;
    }

    let mut distinct: Vec<Bar> = Vec::with_capacity(group.len());
    for (i, (bar, origin)) in group.iter().enumerate() {
        let survivor = group[i + 1..]
            .iter()
            .rev()
            .find(|(later, _)| later.is_identical(bar));
        match survivor {
            Some((_, Origin::Incoming)) if *origin == Origin::Existing => report.overlap += 1,
            Some(_) => report.exact_duplicates += 1,
            None => distinct.push(*bar),
        }
    }

    report.conflicts += distinct.len().saturating_sub(1);
    // max_by_key returns the last of equal maxima, so ties go to the later row.
    distinct
        .into_iter()
        .max_by_key(|bar| bar.volume)
        .unwrap_or(group[group.len() - 1].0)
}

/// Sparse-history check for daily and weekly series.
pub fn detect_gap(series: &Series, interval: Interval) -> Option<GapWarning> {
    let days_per_bar = interval.gap_days_per_bar()?;
    if series.len() < GAP_MIN_BARS {
        return None;
    }
    let (first, last) = (series.first()?, series.last()?);
    let span_days = (last.date() - first.date()).num_days();
    let expected_bars = span_days as f64 / days_per_bar * GAP_OCCUPANCY;

    if (series.len() as f64) < expected_bars * GAP_THRESHOLD {
        Some(GapWarning {
            bars: series.len(),
            span_days,
            expected_bars,
        })
    } else {
        None
    }
}
