//! Data models for the activity pipeline.
//!
//! This module contains the core data structures used throughout
//! the application for representing cells, query outcomes, rankings
//! and run reports.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a grid cell, unique within a city.
pub type CellId = i64;

/// One unit of a city's spatial grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Stable cell identifier from the grid source.
    pub id: CellId,
    /// GeoJSON geometry object, already in the service's reference system.
    pub geometry: Value,
}

impl Cell {
    pub fn new(id: CellId, geometry: Value) -> Self {
        Self { id, geometry }
    }

    /// Wrap the cell in a single-feature FeatureCollection, the form the
    /// service expects for `bpolys`.
    pub fn to_bpolys(&self) -> String {
        json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "id": self.id.to_string(),
                "properties": { "id": self.id },
                "geometry": self.geometry,
            }],
        })
        .to_string()
    }
}

/// Contribution kinds the service reports counts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionKind {
    Creation,
    Modification,
    Deletion,
}

impl ContributionKind {
    /// Parse a service-side kind name. Unknown kinds yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "creation" => Some(Self::Creation),
            "modification" => Some(Self::Modification),
            "deletion" => Some(Self::Deletion),
            _ => None,
        }
    }
}

impl fmt::Display for ContributionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContributionKind::Creation => write!(f, "creation"),
            ContributionKind::Modification => write!(f, "modification"),
            ContributionKind::Deletion => write!(f, "deletion"),
        }
    }
}

/// Per-kind contribution counts for one cell and interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionBreakdown {
    pub creation: u64,
    pub modification: u64,
    pub deletion: u64,
}

impl ContributionBreakdown {
    #[cfg(test)]
    pub fn new(creation: u64, modification: u64, deletion: u64) -> Self {
        Self {
            creation,
            modification,
            deletion,
        }
    }

    /// Add a count to the given kind.
    pub fn add(&mut self, kind: ContributionKind, value: u64) {
        let slot = match kind {
            ContributionKind::Creation => &mut self.creation,
            ContributionKind::Modification => &mut self.modification,
            ContributionKind::Deletion => &mut self.deletion,
        };
        *slot = slot.saturating_add(value);
    }

    /// Sum over the three recognized kinds.
    pub fn total(&self) -> u64 {
        self.creation
            .saturating_add(self.modification)
            .saturating_add(self.deletion)
    }
}

/// Errors raised while parsing a time interval.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("interval must have the form start/end/granularity, got '{0}'")]
    Shape(String),
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    Date(String),
    #[error("interval start {start} must be before end {end}")]
    Order { start: NaiveDate, end: NaiveDate },
    #[error("granularity '{0}' is not an ISO-8601 duration")]
    Granularity(String),
}

/// Half-open date range `[start, end)` with a sampling granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeInterval {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// ISO-8601 duration, e.g. `P1D` or `P1M`.
    pub granularity: String,
}

impl FromStr for TimeInterval {
    type Err = IntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let &[start, end, granularity] = parts.as_slice() else {
            return Err(IntervalError::Shape(s.to_string()));
        };

        let parse_date = |d: &str| {
            NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map_err(|_| IntervalError::Date(d.to_string()))
        };
        let start = parse_date(start)?;
        let end = parse_date(end)?;

        if start >= end {
            return Err(IntervalError::Order { start, end });
        }

        let valid_granularity = granularity.len() > 1
            && granularity.starts_with('P')
            && granularity[1..]
                .chars()
                .all(|c| c.is_ascii_digit() || "YMWDTHS".contains(c));
        if !valid_granularity {
            return Err(IntervalError::Granularity(granularity.to_string()));
        }

        Ok(Self {
            start,
            end,
            granularity: granularity.to_string(),
        })
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d"),
            self.granularity
        )
    }
}

/// How a cell's query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    /// Response received and a breakdown extracted.
    Ok,
    /// The query failed after retries or was rejected.
    Failed,
    /// Response received but no breakdown could be extracted.
    Unparsed,
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellStatus::Ok => write!(f, "ok"),
            CellStatus::Failed => write!(f, "failed"),
            CellStatus::Unparsed => write!(f, "unparsed"),
        }
    }
}

/// Result of processing one cell. Every cell of a city yields exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutcome {
    pub id: CellId,
    /// Activity score; zero for failed or unparsed cells.
    pub total_activity: u64,
    pub status: CellStatus,
    /// Number of requests issued for this cell.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ContributionBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CellOutcome {
    pub fn scored(id: CellId, breakdown: ContributionBreakdown, attempts: u32) -> Self {
        Self {
            id,
            total_activity: breakdown.total(),
            status: CellStatus::Ok,
            attempts,
            breakdown: Some(breakdown),
            error: None,
        }
    }

    pub fn unparsed(id: CellId, attempts: u32) -> Self {
        Self {
            id,
            total_activity: 0,
            status: CellStatus::Unparsed,
            attempts,
            breakdown: None,
            error: Some("response carried no contribution breakdown".to_string()),
        }
    }

    pub fn failed(id: CellId, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            id,
            total_activity: 0,
            status: CellStatus::Failed,
            attempts,
            breakdown: None,
            error: Some(error.into()),
        }
    }

    pub fn scored_cell(&self) -> ScoredCell {
        ScoredCell {
            id: self.id,
            total_activity: self.total_activity,
        }
    }
}

/// A cell id paired with its activity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScoredCell {
    pub id: CellId,
    pub total_activity: u64,
}

impl ScoredCell {
    pub fn new(id: CellId, total_activity: u64) -> Self {
        Self { id, total_activity }
    }
}

/// Top-K cells of a city, highest activity first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedResult {
    pub entries: Vec<ScoredCell>,
}

#[cfg(test)]
impl RankedResult {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<CellId> {
        self.entries.iter().map(|c| c.id).collect()
    }
}

/// Aggregate statistics over all scored cells of a city.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CitySummary {
    pub total: u64,
    pub mean: f64,
    pub max: u64,
    pub count: usize,
}

/// A city's summary as it appears in the cross-city table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitySummaryRow {
    pub city: String,
    pub summary: CitySummary,
}

/// One bucket of a cell's activity time series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucket {
    /// Bucket start as reported by the service (ISO-8601).
    pub timestamp: String,
    pub breakdown: ContributionBreakdown,
}

/// A top-ranked cell with its geometry re-attached.
#[derive(Debug, Clone, PartialEq)]
pub struct TopCell {
    /// 1-based rank within the city.
    pub rank: usize,
    pub id: CellId,
    pub total_activity: u64,
    pub breakdown: Option<ContributionBreakdown>,
    pub geometry: Value,
}

/// Everything the sink needs to persist one city.
#[derive(Debug, Clone)]
pub struct CityReport {
    pub city: String,
    /// Every cell, in ranked order.
    pub table: Vec<ScoredCell>,
    pub top_cells: Vec<TopCell>,
    /// Per-cell outcomes, ordered by id.
    pub outcomes: Vec<CellOutcome>,
    pub summary: CitySummary,
}

impl CityReport {
    pub fn failed_cells(&self) -> impl Iterator<Item = &CellOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status != CellStatus::Ok)
    }
}

/// A city that could not be processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityFailure {
    pub city: String,
    pub error: String,
}

/// Condensed per-city view used in the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityDigest {
    pub city: String,
    pub summary: CitySummary,
    pub top: Vec<ScoredCell>,
    pub failed_cells: Vec<CellOutcome>,
}

impl From<&CityReport> for CityDigest {
    fn from(report: &CityReport) -> Self {
        Self {
            city: report.city.clone(),
            summary: report.summary,
            top: report
                .top_cells
                .iter()
                .map(|c| ScoredCell::new(c.id, c.total_activity))
                .collect(),
            failed_cells: report.failed_cells().cloned().collect(),
        }
    }
}

/// Metadata about a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub started_at: DateTime<Utc>,
    pub base_url: String,
    pub interval: String,
    pub top_k: usize,
    pub max_workers: usize,
    pub cities_processed: usize,
    pub cities_failed: usize,
    pub duration_seconds: f64,
}

/// The complete run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub metadata: RunMetadata,
    pub cities: Vec<CityDigest>,
    pub failed_cities: Vec<CityFailure>,
}

impl RunReport {
    pub fn summary_rows(&self) -> Vec<CitySummaryRow> {
        self.cities
            .iter()
            .map(|c| CitySummaryRow {
                city: c.city.clone(),
                summary: c.summary,
            })
            .collect()
    }
}
