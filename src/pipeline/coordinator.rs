//! Concurrent per-city query coordination.
//!
//! Every cell of a city becomes one task in a `JoinSet`. A semaphore caps
//! the number of queries in flight; tasks wait for a permit before they
//! touch the network and hold it through their retries. Each task returns
//! its own outcome, and the outcomes are merged once all tasks have joined.

use crate::analysis::{extract_breakdown, extract_timeseries, score};
use crate::client::{QueryClient, Transport};
use crate::models::{Cell, CellId, CellOutcome, TimeBucket, TimeInterval};
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Query every cell of a city with at most `max_workers` queries in flight.
///
/// Returns exactly one outcome per input cell, ordered by cell id. Failed
/// queries are logged and recorded with a zero score; they never cancel
/// other cells.
pub async fn run_city<T>(
    client: Arc<QueryClient<T>>,
    city: &str,
    cells: &[Cell],
    interval: &TimeInterval,
    max_workers: usize,
    progress: Option<&ProgressBar>,
) -> Vec<CellOutcome>
where
    T: Transport + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_workers.clamp(1, Semaphore::MAX_PERMITS)));
    let interval = Arc::new(interval.clone());
    let city: Arc<str> = Arc::from(city);
    let mut tasks = JoinSet::new();

    for cell in cells.iter().cloned() {
        let client = Arc::clone(&client);
        let semaphore = Arc::clone(&semaphore);
        let interval = Arc::clone(&interval);
        let city = Arc::clone(&city);

        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return CellOutcome::failed(cell.id, 0, "worker pool closed"),
            };
            score_cell(&client, &city, &cell, &interval).await
        });
    }

    let mut collected = Vec::with_capacity(cells.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => collected.push(outcome),
            Err(e) => warn!(city = %city, error = %e, "Cell task did not complete"),
        }
        if let Some(pb) = progress {
            pb.inc(1);
        }
    }

    let ids: Vec<CellId> = cells.iter().map(|c| c.id).collect();
    merge_outcomes(&ids, collected)
}

/// Query one cell and turn the response into an outcome.
async fn score_cell<T: Transport>(
    client: &QueryClient<T>,
    city: &str,
    cell: &Cell,
    interval: &TimeInterval,
) -> CellOutcome {
    match client.fetch(cell, interval).await {
        Ok(fetched) => {
            let breakdown = extract_breakdown(&fetched.body);
            let activity = score(breakdown);
            match breakdown {
                Some(breakdown) => {
                    debug!(city, cell_id = cell.id, score = activity, "Cell scored");
                    CellOutcome::scored(cell.id, breakdown, fetched.attempts)
                }
                None => {
                    warn!(city, cell_id = cell.id, "Response had no readable breakdown; scoring 0");
                    CellOutcome::unparsed(cell.id, fetched.attempts)
                }
            }
        }
        Err(e) => {
            warn!(
                city,
                cell_id = cell.id,
                transient = e.is_transient(),
                error = %e,
                "Cell query failed; scoring 0"
            );
            CellOutcome::failed(cell.id, e.attempts(), e.to_string())
        }
    }
}

/// Merge collected outcomes against the submitted cell ids.
///
/// Keeps the first outcome per id, drops outcomes for ids that were never
/// submitted, and records a zero-score failure for every submitted id
/// without one. The result is ordered by id.
pub fn merge_outcomes(submitted: &[CellId], collected: Vec<CellOutcome>) -> Vec<CellOutcome> {
    let wanted: HashSet<CellId> = submitted.iter().copied().collect();
    let mut merged: BTreeMap<CellId, CellOutcome> = BTreeMap::new();

    for outcome in collected {
        if wanted.contains(&outcome.id) {
            merged.entry(outcome.id).or_insert(outcome);
        }
    }

    for &id in submitted {
        merged
            .entry(id)
            .or_insert_with(|| CellOutcome::failed(id, 0, "task did not complete"));
    }

    merged.into_values().collect()
}

/// Fetch time series for the given cells, at most `max_workers` at a time.
///
/// Cells whose query fails or whose response cannot be read get an empty
/// series. Results are ordered by cell id.
pub async fn fetch_timeseries<T: Transport>(
    client: &QueryClient<T>,
    city: &str,
    cells: &[&Cell],
    interval: &TimeInterval,
    max_workers: usize,
) -> Vec<(CellId, Vec<TimeBucket>)> {
    let mut series: Vec<(CellId, Vec<TimeBucket>)> = stream::iter(cells.iter().copied())
        .map(|cell| async move {
            let buckets = match client.fetch_timeseries(cell, interval).await {
                Ok(fetched) => extract_timeseries(&fetched.body).unwrap_or_else(|| {
                    warn!(city, cell_id = cell.id, "Unreadable time series response");
                    Vec::new()
                }),
                Err(e) => {
                    warn!(city, cell_id = cell.id, error = %e, "Time series query failed");
                    Vec::new()
                }
            };
            (cell.id, buckets)
        })
        .buffer_unordered(max_workers.max(1))
        .collect()
        .await;

    series.sort_by_key(|(id, _)| *id);
    series
}
