//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::config::MAX_WORKERS;
use crate::report::ReportFormat;
use clap::Parser;
use std::path::PathBuf;

/// Cellpulse - rank grid cells by OpenStreetMap edit activity
///
/// Reads one 1 km grid per city, asks the ohsome API how many
/// contributions landed in every cell, and writes ranked tables,
/// top-cell GeoJSON and a run report.
///
/// Examples:
///   cellpulse --grid-dir grades_1km_por_cidade
///   cellpulse --city Curitiba --city Campinas --top-k 20
///   cellpulse --interval 2020-01-01/2021-01-01/P1M --no-timeseries
///   cellpulse --dry-run
///   cellpulse --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for .cellpulse.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory with one grid GeoJSON per city
    #[arg(short, long, value_name = "DIR")]
    pub grid_dir: Option<PathBuf>,

    /// Directory results are written to
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Only process this city (repeatable, case-insensitive)
    #[arg(long, value_name = "NAME")]
    pub city: Vec<String>,

    /// Counting window as start/end/granularity
    ///
    /// Example: 2018-11-01/2021-05-01/P1D
    #[arg(short, long, value_name = "INTERVAL")]
    pub interval: Option<String>,

    /// ohsome API root URL
    #[arg(long, value_name = "URL", env = "CELLPULSE_BASE_URL")]
    pub base_url: Option<String>,

    /// ohsome filter expression applied to every query
    ///
    /// Example: --filter "building=* and geometry:polygon"
    #[arg(long, value_name = "EXPR")]
    pub filter: Option<String>,

    /// Maximum concurrent queries per city
    #[arg(short = 'w', long, value_name = "NUM")]
    pub max_workers: Option<usize>,

    /// Retries after the first attempt on 429 or network failure
    #[arg(long, value_name = "NUM")]
    pub max_retries: Option<u32>,

    /// Backoff unit in milliseconds; retry n waits n times this
    #[arg(long, value_name = "MS")]
    pub retry_base_delay_ms: Option<u64>,

    /// Number of top cells kept per city
    #[arg(short = 'k', long, value_name = "K")]
    pub top_k: Option<usize>,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Skip time series for top cells
    #[arg(long)]
    pub no_timeseries: bool,

    /// Time series window as start/end/granularity
    #[arg(long, value_name = "INTERVAL")]
    pub timeseries_interval: Option<String>,

    /// Run report format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Dry run: list cities and cell counts without querying
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .cellpulse.toml configuration file
    #[arg(long)]
    pub init_config: bool,

    /// Exit with code 2 when any city could not be processed
    ///
    /// Useful for scheduled runs that must notice broken grid files.
    #[arg(long)]
    pub fail_on_city_error: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,
}

/// Output format for the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl From<OutputFormat> for ReportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Markdown => ReportFormat::Markdown,
            OutputFormat::Json => ReportFormat::Json,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if let Some(ref url) = self.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Base URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if let Some(workers) = self.max_workers {
            if workers == 0 || workers > MAX_WORKERS {
                return Err(format!("Max workers must be between 1 and {}", MAX_WORKERS));
            }
        }

        if self.top_k == Some(0) {
            return Err("Top K must be at least 1".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.no_timeseries && self.timeseries_interval.is_some() {
            return Err("Cannot use --timeseries-interval with --no-timeseries".to_string());
        }

        if let Some(ref dir) = self.grid_dir {
            if !dir.is_dir() {
                return Err(format!("Grid directory does not exist: {}", dir.display()));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            config: None,
            grid_dir: None,
            output_dir: None,
            city: Vec::new(),
            interval: None,
            base_url: None,
            filter: None,
            max_workers: None,
            max_retries: None,
            retry_base_delay_ms: None,
            top_k: None,
            timeout: None,
            no_timeseries: false,
            timeseries_interval: None,
            format: OutputFormat::Markdown,
            dry_run: false,
            init_config: false,
            fail_on_city_error: false,
            verbose: false,
            quiet: false,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(make_args().validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_url() {
        let mut args = make_args();
        args.base_url = Some("api.ohsome.org".to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_worker_bounds() {
        let mut args = make_args();
        args.max_workers = Some(0);
        assert!(args.validate().is_err());

        args.max_workers = Some(usize::MAX);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.no_timeseries = true;
        args.timeseries_interval = Some("2019-01-01/2020-01-01/P1M".to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_parse_repeated_cities() {
        let args = Args::try_parse_from([
            "cellpulse",
            "--city",
            "Curitiba",
            "--city",
            "Campinas",
            "-k",
            "5",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.city, vec!["Curitiba", "Campinas"]);
        assert_eq!(args.top_k, Some(5));
        assert_eq!(ReportFormat::from(args.format), ReportFormat::Json);
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
