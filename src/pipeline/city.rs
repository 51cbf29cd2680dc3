//! Single-city pipeline: query, rank, and collect supporting detail.

use crate::analysis::{rank, sort_scored};
use crate::client::{QueryClient, Transport};
use crate::models::{
    Cell, CellId, CellOutcome, CityReport, ScoredCell, TimeBucket, TimeInterval, TopCell,
};
use crate::pipeline::coordinator::{fetch_timeseries, run_city};
use indicatif::ProgressBar;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Settings shared by every city of a run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub interval: TimeInterval,
    pub max_workers: usize,
    pub top_k: usize,
    /// Interval for top-cell time series; `None` disables them.
    pub timeseries_interval: Option<TimeInterval>,
}

/// The cells of one city, alive for the duration of that city's run.
#[derive(Debug, Clone)]
pub struct CityRun {
    pub city: String,
    pub cells: Vec<Cell>,
}

/// Everything produced for one city.
#[derive(Debug, Clone)]
pub struct CityResult {
    pub report: CityReport,
    pub timeseries: Vec<(CellId, Vec<TimeBucket>)>,
}

/// Run the full pipeline for one city.
pub async fn process_city<T>(
    client: Arc<QueryClient<T>>,
    run: CityRun,
    settings: &PipelineSettings,
    progress: Option<&ProgressBar>,
) -> CityResult
where
    T: Transport + 'static,
{
    info!(
        city = %run.city,
        cells = run.cells.len(),
        interval = %settings.interval,
        "Querying cells"
    );

    let outcomes = run_city(
        Arc::clone(&client),
        &run.city,
        &run.cells,
        &settings.interval,
        settings.max_workers,
        progress,
    )
    .await;

    let report = build_report(&run, outcomes, settings.top_k);

    let timeseries = match settings.timeseries_interval {
        Some(ref ts_interval) if !report.top_cells.is_empty() => {
            let lookup: HashMap<CellId, &Cell> = run.cells.iter().map(|c| (c.id, c)).collect();
            let top: Vec<&Cell> = report
                .top_cells
                .iter()
                .filter_map(|t| lookup.get(&t.id).copied())
                .collect();
            info!(city = %run.city, cells = top.len(), interval = %ts_interval, "Fetching time series");
            fetch_timeseries(&client, &run.city, &top, ts_interval, settings.max_workers).await
        }
        _ => Vec::new(),
    };

    info!(
        city = %run.city,
        total = report.summary.total,
        max = report.summary.max,
        failed = report.failed_cells().count(),
        "City complete"
    );

    CityResult { report, timeseries }
}

/// Rank a city's outcomes and re-attach geometry to the top cells.
pub fn build_report(
    run: &CityRun,
    outcomes: Vec<CellOutcome>,
    top_k: usize,
) -> CityReport {
    let scored: Vec<ScoredCell> = outcomes.iter().map(CellOutcome::scored_cell).collect();
    let (ranked, summary) = rank(&scored, top_k);

    let geometry: HashMap<CellId, &Cell> = run.cells.iter().map(|c| (c.id, c)).collect();
    let by_id: HashMap<CellId, &CellOutcome> = outcomes.iter().map(|o| (o.id, o)).collect();

    let top_cells = ranked
        .entries
        .iter()
        .enumerate()
        .map(|(i, entry)| TopCell {
            rank: i + 1,
            id: entry.id,
            total_activity: entry.total_activity,
            breakdown: by_id.get(&entry.id).and_then(|o| o.breakdown),
            geometry: geometry
                .get(&entry.id)
                .map(|c| c.geometry.clone())
                .unwrap_or(serde_json::Value::Null),
        })
        .collect();

    CityReport {
        city: run.city.clone(),
        table: sort_scored(&scored),
        top_cells,
        outcomes,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::testing::{ScriptedTransport, Step};
    use crate::client::RetryPolicy;
    use crate::models::ContributionBreakdown;
    use serde_json::json;
    use std::time::Duration;

    fn square(id: i64) -> Cell {
        Cell::new(
            id,
            json!({"type": "Polygon", "coordinates": [[[id as f64, 0.0], [id as f64 + 1.0, 0.0], [id as f64, 1.0], [id as f64, 0.0]]]}),
        )
    }

    fn interval() -> TimeInterval {
        "2018-11-01/2021-05-01/P1D".parse().unwrap()
    }

    #[test]
    fn test_build_report_attaches_geometry_and_ranks() {
        let run = CityRun {
            city: "Curitiba".to_string(),
            cells: vec![square(1), square(2), square(3)],
        };
        let outcomes = vec![
            CellOutcome::scored(1, ContributionBreakdown::new(50, 0, 0), 1),
            CellOutcome::scored(2, ContributionBreakdown::new(80, 10, 0), 1),
            CellOutcome::failed(3, 4, "timed out"),
        ];

        let report = build_report(&run, outcomes, 2);

        assert_eq!(report.table.len(), 3);
        assert_eq!(report.table[2], ScoredCell::new(3, 0));
        assert_eq!(report.top_cells.len(), 2);
        assert_eq!(report.top_cells[0].id, 2);
        assert_eq!(report.top_cells[0].rank, 1);
        assert_eq!(report.top_cells[0].geometry, square(2).geometry);
        assert_eq!(report.top_cells[0].breakdown, Some(ContributionBreakdown::new(80, 10, 0)));
        assert_eq!(report.summary.total, 140);
        assert_eq!(report.failed_cells().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_city_with_every_cell_failing_still_reports() {
        let transport = Arc::new(ScriptedTransport::new(Step::status(503)));
        let client = Arc::new(QueryClient::new(
            transport.clone(),
            "https://api.example.org/v1",
            RetryPolicy::new(1, Duration::from_millis(10)),
        ));
        let settings = PipelineSettings {
            interval: interval(),
            max_workers: 4,
            top_k: 2,
            timeseries_interval: Some("2018-11-01/2021-05-01/P1M".parse().unwrap()),
        };
        let run = CityRun {
            city: "Vitória".to_string(),
            cells: vec![square(7), square(5), square(6)],
        };

        let result = process_city(client, run, &settings, None).await;

        assert_eq!(result.report.table.len(), 3);
        assert!(result.report.table.iter().all(|c| c.total_activity == 0));
        assert_eq!(result.report.top_cells.iter().map(|c| c.id).collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(result.timeseries.len(), 2);
        assert!(result.timeseries.iter().all(|(_, s)| s.is_empty()));
        // 3 count queries + 2 time series queries, none retried on 503
        assert_eq!(transport.total_calls(), 5);
    }
}
