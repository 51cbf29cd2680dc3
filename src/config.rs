//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.cellpulse.toml` files.

use crate::client::RetryPolicy;
use crate::models::TimeInterval;
use crate::pipeline::PipelineSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".cellpulse.toml";

/// Upper bound on concurrent queries per city.
pub const MAX_WORKERS: usize = 256;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// ohsome query settings.
    #[serde(default)]
    pub query: QueryConfig,

    /// Concurrency and ranking settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Time series for top cells.
    #[serde(default)]
    pub timeseries: TimeseriesConfig,

    /// Grid source settings.
    #[serde(default)]
    pub grid: GridConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory holding one grid GeoJSON file per city.
    #[serde(default = "default_grid_dir")]
    pub grid_dir: PathBuf,

    /// Directory results are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Cities to process; empty means every grid file found.
    #[serde(default)]
    pub cities: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            grid_dir: default_grid_dir(),
            output_dir: default_output_dir(),
            cities: Vec::new(),
        }
    }
}

fn default_grid_dir() -> PathBuf {
    PathBuf::from("grids")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Remote service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// ohsome API root.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Counting window, `start/end/granularity`.
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Optional ohsome filter expression.
    #[serde(default)]
    pub filter: String,

    /// Per-attempt request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Retries after the first attempt on 429 or transport failure.
    #[serde(default = "default_retries")]
    pub max_retries: u32,

    /// Backoff unit in milliseconds; retry n waits n times this.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            interval: default_interval(),
            filter: String::new(),
            timeout_seconds: default_timeout(),
            max_retries: default_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.ohsome.org/v1".to_string()
}

fn default_interval() -> String {
    "2018-11-01/2021-05-01/P1D".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    2000
}

/// Concurrency and ranking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum queries in flight per city.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Cells kept per city after ranking.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            top_k: default_top_k(),
        }
    }
}

fn default_max_workers() -> usize {
    10
}

fn default_top_k() -> usize {
    10
}

/// Time series settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeseriesConfig {
    /// Fetch a time series for every top cell.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time series window, usually monthly.
    #[serde(default = "default_timeseries_interval")]
    pub interval: String,
}

impl Default for TimeseriesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_timeseries_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeseries_interval() -> String {
    "2018-11-01/2021-05-01/P1M".to_string()
}

/// Grid source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Reference systems the service can take without reprojection.
    #[serde(default = "default_accepted_crs")]
    pub accepted_crs: Vec<String>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            accepted_crs: default_accepted_crs(),
        }
    }
}

fn default_accepted_crs() -> Vec<String> {
    vec!["EPSG:4326", "OGC:CRS84", "EPSG:4674"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref dir) = args.grid_dir {
            self.general.grid_dir = dir.clone();
        }
        if let Some(ref dir) = args.output_dir {
            self.general.output_dir = dir.clone();
        }
        if !args.city.is_empty() {
            self.general.cities = args.city.clone();
        }

        if let Some(ref url) = args.base_url {
            self.query.base_url = url.clone();
        }
        if let Some(ref interval) = args.interval {
            self.query.interval = interval.clone();
        }
        if let Some(ref filter) = args.filter {
            self.query.filter = filter.clone();
        }
        if let Some(timeout) = args.timeout {
            self.query.timeout_seconds = timeout;
        }
        if let Some(retries) = args.max_retries {
            self.query.max_retries = retries;
        }
        if let Some(delay) = args.retry_base_delay_ms {
            self.query.retry_base_delay_ms = delay;
        }

        if let Some(workers) = args.max_workers {
            self.pipeline.max_workers = workers;
        }
        if let Some(top_k) = args.top_k {
            self.pipeline.top_k = top_k;
        }

        if args.no_timeseries {
            self.timeseries.enabled = false;
        }
        if let Some(ref interval) = args.timeseries_interval {
            self.timeseries.interval = interval.clone();
        }
    }

    /// Check values that the file format cannot constrain.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_workers == 0 || self.pipeline.max_workers > MAX_WORKERS {
            anyhow::bail!("pipeline.max_workers must be between 1 and {}", MAX_WORKERS);
        }
        if self.pipeline.top_k == 0 {
            anyhow::bail!("pipeline.top_k must be at least 1");
        }
        if self.query.timeout_seconds == 0 {
            anyhow::bail!("query.timeout_seconds must be at least 1");
        }
        if !self.query.base_url.starts_with("http://")
            && !self.query.base_url.starts_with("https://")
        {
            anyhow::bail!("query.base_url must start with 'http://' or 'https://'");
        }
        if self.grid.accepted_crs.is_empty() {
            anyhow::bail!("grid.accepted_crs must list at least one reference system");
        }

        self.interval()?;
        if self.timeseries.enabled {
            self.timeseries_interval()?;
        }

        Ok(())
    }

    /// The counting window.
    pub fn interval(&self) -> Result<TimeInterval> {
        self.query
            .interval
            .parse()
            .with_context(|| format!("Invalid query.interval '{}'", self.query.interval))
    }

    /// The time series window, if time series are enabled.
    pub fn timeseries_interval(&self) -> Result<Option<TimeInterval>> {
        if !self.timeseries.enabled {
            return Ok(None);
        }
        self.timeseries
            .interval
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid timeseries.interval '{}'", self.timeseries.interval))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.query.max_retries,
            Duration::from_millis(self.query.retry_base_delay_ms),
        )
    }

    pub fn filter(&self) -> Option<String> {
        Some(self.query.filter.clone()).filter(|f| !f.trim().is_empty())
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        Ok(PipelineSettings {
            interval: self.interval()?,
            max_workers: self.pipeline.max_workers,
            top_k: self.pipeline.top_k,
            timeseries_interval: self.timeseries_interval()?,
        })
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
