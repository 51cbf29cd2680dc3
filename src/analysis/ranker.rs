//! Ranking and per-city statistics.

use crate::models::{CitySummary, RankedResult, ScoredCell};
use std::cmp::Reverse;

/// Sort cells by activity, highest first, ties broken by ascending id.
///
/// The order is total, so it does not depend on the order results
/// arrived in.
pub fn sort_scored(cells: &[ScoredCell]) -> Vec<ScoredCell> {
    let mut sorted = cells.to_vec();
    sorted.sort_by_key(|c| (Reverse(c.total_activity), c.id));
    sorted
}

/// Rank a city's cells and summarize them.
///
/// The ranking holds at most `top_k` entries; the summary covers every
/// cell.
pub fn rank(cells: &[ScoredCell], top_k: usize) -> (RankedResult, CitySummary) {
    let mut entries = sort_scored(cells);
    entries.truncate(top_k);
    (RankedResult { entries }, summarize(cells))
}

/// Sum, mean, max and count over all cells.
pub fn summarize(cells: &[ScoredCell]) -> CitySummary {
    let count = cells.len();
    let total: u64 = cells.iter().map(|c| c.total_activity).sum();
    let max = cells.iter().map(|c| c.total_activity).max().unwrap_or(0);
    let mean = if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    };

    CitySummary {
        total,
        mean,
        max,
        count,
    }
}
