//! Grid source: city discovery and cell loading.
//!
//! Each city is one GeoJSON FeatureCollection of grid cells, named like
//! `grade_1km_<City>_<EPSG code>.geojson`. Cells must already be in a
//! reference system the service accepts; nothing here reprojects.

use crate::models::{Cell, CellId};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Failures that abort one city's run.
#[derive(Debug, Error)]
pub enum CityError {
    #[error("cannot read grid file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("grid file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("grid file {0} is not a GeoJSON FeatureCollection")]
    NotFeatureCollection(PathBuf),

    #[error("grid is in {crs}, which is not an accepted reference system ({accepted})")]
    UnsupportedCrs { crs: String, accepted: String },

    #[error("cell id {0} appears more than once")]
    DuplicateCellId(CellId),
}

/// A city's grid file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitySource {
    /// Display name, taken from the file name.
    pub name: String,
    pub path: PathBuf,
    /// Reference system suggested by the file name, if any.
    pub crs_hint: Option<String>,
}

impl CitySource {
    pub fn from_path(path: PathBuf) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let (name, crs_hint) = parse_grid_file_name(&stem);
        Self {
            name,
            path,
            crs_hint,
        }
    }
}

/// Split a grid file stem into city name and CRS hint.
///
/// `grade_1km_São Paulo_4674` gives `("São Paulo", Some("EPSG:4674"))`.
/// Stems with fewer than three `_`-separated parts are used whole.
pub fn parse_grid_file_name(stem: &str) -> (String, Option<String>) {
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 3 {
        return (stem.to_string(), None);
    }

    let crs_hint = parts
        .last()
        .filter(|p| parts.len() >= 4 && !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        .map(|code| format!("EPSG:{}", code));

    (parts[2].to_string(), crs_hint)
}

/// List every `.geojson` file directly inside `grid_dir`, sorted by city name.
pub fn discover_cities(grid_dir: &Path) -> Result<Vec<CitySource>> {
    if !grid_dir.is_dir() {
        anyhow::bail!("Grid directory does not exist: {}", grid_dir.display());
    }

    let mut cities = Vec::new();
    for entry in WalkDir::new(grid_dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to list {}", grid_dir.display()))?;
        let path = entry.path();

        let is_geojson = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("geojson"));

        if entry.file_type().is_file() && is_geojson {
            cities.push(CitySource::from_path(path.to_path_buf()));
        } else {
            debug!("Skipping {}", path.display());
        }
    }

    cities.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
    Ok(cities)
}

/// Keep only the requested cities, in the requested order.
///
/// Names are matched case-insensitively. Unknown names are returned
/// separately so the caller can report them.
pub fn select_cities(available: Vec<CitySource>, wanted: &[String]) -> (Vec<CitySource>, Vec<String>) {
    if wanted.is_empty() {
        return (available, Vec::new());
    }

    let mut selected = Vec::new();
    let mut missing = Vec::new();
    for name in wanted {
        match available.iter().find(|c| c.name.to_lowercase() == name.to_lowercase()) {
            Some(city) => selected.push(city.clone()),
            None => missing.push(name.clone()),
        }
    }
    (selected, missing)
}

/// Load a city's cells from its grid file.
pub fn load_grid(source: &CitySource, accepted_crs: &[String]) -> Result<Vec<Cell>, CityError> {
    let text = std::fs::read_to_string(&source.path).map_err(|e| CityError::Read {
        path: source.path.clone(),
        source: e,
    })?;

    let document: Value = serde_json::from_str(&text).map_err(|e| CityError::Parse {
        path: source.path.clone(),
        source: e,
    })?;

    parse_grid(&document, &source.path, source.crs_hint.as_deref(), accepted_crs)
}

/// Extract cells from a parsed FeatureCollection.
pub fn parse_grid(
    document: &Value,
    path: &Path,
    crs_hint: Option<&str>,
    accepted_crs: &[String],
) -> Result<Vec<Cell>, CityError> {
    if document.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err(CityError::NotFeatureCollection(path.to_path_buf()));
    }

    let crs = document
        .pointer("/crs/properties/name")
        .and_then(Value::as_str)
        .map(normalize_crs)
        .or_else(|| crs_hint.map(normalize_crs))
        .unwrap_or_else(|| "EPSG:4326".to_string());

    if !accepted_crs.iter().any(|a| normalize_crs(a) == crs) {
        return Err(CityError::UnsupportedCrs {
            crs,
            accepted: accepted_crs.join(", "),
        });
    }

    let features = document
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| CityError::NotFeatureCollection(path.to_path_buf()))?;

    let mut seen = HashSet::new();
    let mut cells = Vec::with_capacity(features.len());

    for (index, feature) in features.iter().enumerate() {
        let Some(id) = feature_id(feature) else {
            warn!("{}: feature {} has no integer id; skipping", path.display(), index);
            continue;
        };

        let geometry = match feature.get("geometry") {
            Some(g) if g.is_object() => g.clone(),
            _ => {
                warn!("{}: cell {} has no geometry; skipping", path.display(), id);
                continue;
            }
        };

        if !seen.insert(id) {
            return Err(CityError::DuplicateCellId(id));
        }
        cells.push(Cell::new(id, geometry));
    }

    debug!("{}: loaded {} cells in {}", path.display(), cells.len(), crs);
    Ok(cells)
}

/// `properties.id`, falling back to the feature `id`. Integral floats and
/// numeric strings are accepted.
fn feature_id(feature: &Value) -> Option<CellId> {
    let raw = feature
        .pointer("/properties/id")
        .filter(|v| !v.is_null())
        .or_else(|| feature.get("id"))?;

    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Normalize a CRS name to `AUTHORITY:CODE`.
///
/// Handles the OGC URN forms found in legacy GeoJSON `crs` members, e.g.
/// `urn:ogc:def:crs:EPSG::4674` and `urn:ogc:def:crs:OGC:1.3:CRS84`.
pub fn normalize_crs(name: &str) -> String {
    let name = name.trim();
    let lower = name.to_lowercase();

    if lower.starts_with("urn:ogc:def:crs:") {
        let rest: Vec<&str> = name["urn:ogc:def:crs:".len()..]
            .split(':')
            .filter(|p| !p.is_empty())
            .collect();
        if let (Some(authority), Some(code)) = (rest.first(), rest.last()) {
            return format!("{}:{}", authority.to_uppercase(), code.to_uppercase());
        }
    }

    name.to_uppercase()
}
