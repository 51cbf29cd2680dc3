//! Result persistence.
//!
//! [`ResultSink`] is what the driver hands finished cities to. [`FileSink`]
//! writes the tables and GeoJSON downstream tools read by column name
//! (`id`, `total_activity`), so those names must not change.

use crate::models::{
    CellId, CellOutcome, CityReport, CitySummaryRow, RunReport, ScoredCell, TimeBucket, TopCell,
};
use crate::report::generator::{generate_json_report, generate_markdown_report};
use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Run report flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Markdown,
    Json,
}

/// Consumer of finished results.
pub trait ResultSink {
    /// Persist one city's cell table, top cells and raw per-cell log.
    fn write_city(&self, report: &CityReport) -> Result<()>;

    /// Persist the time series of one top cell.
    fn write_timeseries(&self, city: &str, cell_id: CellId, series: &[TimeBucket]) -> Result<()>;

    /// Persist the cross-city summary table.
    fn write_summary(&self, rows: &[CitySummaryRow]) -> Result<()>;

    /// Persist the human-readable run report.
    fn write_run_report(&self, report: &RunReport) -> Result<()>;
}

/// Writes results as files under an output directory.
pub struct FileSink {
    root: PathBuf,
    top_k: usize,
    format: ReportFormat,
}

impl FileSink {
    /// Create the sink, creating `root` if needed.
    pub fn new(root: impl Into<PathBuf>, top_k: usize, format: ReportFormat) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create output directory {}", root.display()))?;
        Ok(Self {
            root,
            top_k,
            format,
        })
    }

    pub fn all_cells_path(&self, city: &str) -> PathBuf {
        self.root.join(format!("all_cells_{}.csv", file_safe(city)))
    }

    pub fn top_cells_path(&self, city: &str) -> PathBuf {
        self.root
            .join(format!("top_{}_{}.geojson", self.top_k, file_safe(city)))
    }

    pub fn raw_log_path(&self, city: &str) -> PathBuf {
        self.root.join(format!("raw_{}.jsonl", file_safe(city)))
    }

    pub fn timeseries_path(&self, city: &str, cell_id: CellId) -> PathBuf {
        self.root
            .join("timeseries")
            .join(file_safe(city))
            .join(format!("cell_{}_timeseries.csv", cell_id))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join("cities_summary.csv")
    }

    pub fn report_path(&self) -> PathBuf {
        match self.format {
            ReportFormat::Markdown => self.root.join("report.md"),
            ReportFormat::Json => self.root.join("report.json"),
        }
    }
}

impl ResultSink for FileSink {
    fn write_city(&self, report: &CityReport) -> Result<()> {
        write_file(&self.all_cells_path(&report.city), &cells_table_csv(&report.table)?)?;

        let geojson = serde_json::to_string_pretty(&top_cells_geojson(&report.top_cells))?;
        write_file(&self.top_cells_path(&report.city), &geojson)?;

        write_file(&self.raw_log_path(&report.city), &raw_log_jsonl(&report.outcomes)?)?;

        debug!(city = %report.city, "Wrote city outputs to {}", self.root.display());
        Ok(())
    }

    fn write_timeseries(&self, city: &str, cell_id: CellId, series: &[TimeBucket]) -> Result<()> {
        let path = self.timeseries_path(city, cell_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        write_file(&path, &timeseries_csv(series)?)
    }

    fn write_summary(&self, rows: &[CitySummaryRow]) -> Result<()> {
        write_file(&self.summary_path(), &summary_csv(rows)?)
    }

    fn write_run_report(&self, report: &RunReport) -> Result<()> {
        let content = match self.format {
            ReportFormat::Markdown => generate_markdown_report(report),
            ReportFormat::Json => generate_json_report(report)?,
        };
        write_file(&self.report_path(), &content)
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Make a city name usable as a file name component.
pub fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect()
}

/// Header row of the per-city cell table.
const CELLS_HEADER: [&str; 2] = ["id", "total_activity"];

const TIMESERIES_HEADER: [&str; 5] = ["timestamp", "creation", "modification", "deletion", "total"];

const SUMMARY_HEADER: [&str; 5] = [
    "city",
    "total_activity",
    "average_activity",
    "max_activity",
    "cells_processed",
];

#[derive(Serialize)]
struct TimeseriesRow<'a> {
    timestamp: &'a str,
    creation: u64,
    modification: u64,
    deletion: u64,
    total: u64,
}

#[derive(Serialize)]
struct SummaryRow<'a> {
    city: &'a str,
    total_activity: u64,
    average_activity: String,
    max_activity: u64,
    cells_processed: usize,
}

/// Render rows under an explicit header, so empty tables keep their header.
fn csv_string<R: Serialize>(header: &[&str], rows: impl IntoIterator<Item = R>) -> Result<String> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.serialize(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV buffer: {}", e.error()))?;
    Ok(String::from_utf8(bytes)?)
}

/// `id,total_activity` rows in the given order.
pub fn cells_table_csv(table: &[ScoredCell]) -> Result<String> {
    csv_string(&CELLS_HEADER, table)
}

/// Top cells as a FeatureCollection, rank order.
pub fn top_cells_geojson(cells: &[TopCell]) -> Value {
    let features: Vec<Value> = cells
        .iter()
        .map(|cell| {
            let breakdown = cell.breakdown.unwrap_or_default();
            json!({
                "type": "Feature",
                "properties": {
                    "id": cell.id,
                    "total_activity": cell.total_activity,
                    "rank": cell.rank,
                    "creation": breakdown.creation,
                    "modification": breakdown.modification,
                    "deletion": breakdown.deletion,
                },
                "geometry": cell.geometry,
            })
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "features": features,
    })
}

/// One JSON object per cell outcome.
pub fn raw_log_jsonl(outcomes: &[CellOutcome]) -> Result<String> {
    let mut out = String::new();
    for outcome in outcomes {
        out.push_str(&serde_json::to_string(outcome)?);
        out.push('\n');
    }
    Ok(out)
}

/// `timestamp,creation,modification,deletion,total` rows.
pub fn timeseries_csv(series: &[TimeBucket]) -> Result<String> {
    csv_string(
        &TIMESERIES_HEADER,
        series.iter().map(|bucket| TimeseriesRow {
            timestamp: &bucket.timestamp,
            creation: bucket.breakdown.creation,
            modification: bucket.breakdown.modification,
            deletion: bucket.breakdown.deletion,
            total: bucket.breakdown.total(),
        }),
    )
}

/// `city,total_activity,average_activity,max_activity,cells_processed` rows.
/// The average is written with two decimals.
pub fn summary_csv(rows: &[CitySummaryRow]) -> Result<String> {
    csv_string(
        &SUMMARY_HEADER,
        rows.iter().map(|row| SummaryRow {
            city: &row.city,
            total_activity: row.summary.total,
            average_activity: format!("{:.2}", row.summary.mean),
            max_activity: row.summary.max,
            cells_processed: row.summary.count,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CitySummary, ContributionBreakdown};
    use tempfile::TempDir;

    fn city_report() -> CityReport {
        let outcomes = vec![
            CellOutcome::scored(1, ContributionBreakdown::new(40, 8, 2), 1),
            CellOutcome::failed(2, 4, "rate limited"),
        ];
        CityReport {
            city: "São Paulo".to_string(),
            table: vec![ScoredCell::new(1, 50), ScoredCell::new(2, 0)],
            top_cells: vec![TopCell {
                rank: 1,
                id: 1,
                total_activity: 50,
                breakdown: Some(ContributionBreakdown::new(40, 8, 2)),
                geometry: json!({"type": "Polygon", "coordinates": []}),
            }],
            outcomes,
            summary: CitySummary {
                total: 50,
                mean: 25.0,
                max: 50,
                count: 2,
            },
        }
    }

    #[test]
    fn test_cells_table_keeps_failed_cells() {
        let csv = cells_table_csv(&city_report().table).unwrap();
        assert_eq!(csv, "id,total_activity\n1,50\n2,0\n");
    }

    #[test]
    fn test_top_cells_geojson_properties() {
        let geojson = top_cells_geojson(&city_report().top_cells);
        let props = &geojson["features"][0]["properties"];
        assert_eq!(geojson["type"], "FeatureCollection");
        assert_eq!(props["id"], 1);
        assert_eq!(props["total_activity"], 50);
        assert_eq!(props["creation"], 40);
        assert_eq!(geojson["features"][0]["geometry"]["type"], "Polygon");
    }

    #[test]
    fn test_summary_csv_quotes_and_rounds() {
        let rows = vec![CitySummaryRow {
            city: "Rio, RJ".to_string(),
            summary: CitySummary {
                total: 230,
                mean: 230.0 / 3.0,
                max: 90,
                count: 3,
            },
        }];
        assert_eq!(
            summary_csv(&rows).unwrap(),
            "city,total_activity,average_activity,max_activity,cells_processed\n\"Rio, RJ\",230,76.67,90,3\n"
        );
    }

    #[test]
    fn test_summary_csv_escapes_embedded_quotes() {
        let rows = vec![CitySummaryRow {
            city: "Vila \"Nova\"".to_string(),
            summary: CitySummary::default(),
        }];
        let csv = summary_csv(&rows).unwrap();
        assert_eq!(csv.lines().nth(1), Some("\"Vila \"\"Nova\"\"\",0,0.00,0,0"));
    }

    #[test]
    fn test_timeseries_csv() {
        let series = vec![TimeBucket {
            timestamp: "2019-01-01T00:00:00Z".to_string(),
            breakdown: ContributionBreakdown::new(3, 2, 1),
        }];
        assert_eq!(
            timeseries_csv(&series).unwrap(),
            "timestamp,creation,modification,deletion,total\n2019-01-01T00:00:00Z,3,2,1,6\n"
        );
    }

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("São Paulo"), "São Paulo");
        assert_eq!(file_safe("a/b:c"), "a-b-c");
    }

    #[test]
    fn test_file_sink_writes_city_outputs() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::new(dir.path().join("out"), 10, ReportFormat::Markdown).unwrap();
        let report = city_report();

        sink.write_city(&report).unwrap();
        sink.write_timeseries(&report.city, 1, &[]).unwrap();

        let all = std::fs::read_to_string(sink.all_cells_path("São Paulo")).unwrap();
        assert!(all.starts_with("id,total_activity\n"));
        assert!(dir.path().join("out").join("top_10_São Paulo.geojson").exists());

        let raw = std::fs::read_to_string(sink.raw_log_path("São Paulo")).unwrap();
        let lines: Vec<Value> = raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["status"], "failed");
        assert_eq!(lines[1]["total_activity"], 0);

        let ts = std::fs::read_to_string(sink.timeseries_path("São Paulo", 1)).unwrap();
        assert_eq!(ts, "timestamp,creation,modification,deletion,total\n");
    }
}
