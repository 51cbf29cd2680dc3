//! Cellpulse - OpenStreetMap activity ranking for city grids
//!
//! A CLI tool that asks the ohsome API how many contributions landed in
//! every cell of a per-city grid, then ranks the cells and writes tables,
//! GeoJSON and a run report.
//!
//! Exit codes:
//!   0 - Success (cities that failed are listed in the report)
//!   1 - Runtime error (config, grid directory, output directory, etc.)
//!   2 - At least one city failed and --fail-on-city-error was set

mod analysis;
mod cli;
mod client;
mod config;
mod grid;
mod models;
mod pipeline;
mod report;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::Args;
use client::{HttpTransport, QueryClient};
use config::{Config, CONFIG_FILE};
use grid::CitySource;
use indicatif::{ProgressBar, ProgressStyle};
use models::{CityDigest, CityFailure, RunMetadata, RunReport};
use pipeline::{process_city, CityRun, PipelineSettings};
use report::{FileSink, ResultSink};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("Cellpulse v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .cellpulse.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to set the grid directory, interval, filter, and more.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run every selected city. Returns exit code (0 or 2).
async fn run(args: Args) -> Result<i32> {
    let start_time = Instant::now();
    let started_at = Utc::now();

    // Load configuration
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate()?;

    let settings = config.pipeline_settings()?;

    // Step 1: Find the grids
    let available = grid::discover_cities(&config.general.grid_dir)?;
    let (cities, missing) = grid::select_cities(available, &config.general.cities);
    for name in &missing {
        warn!("No grid file for requested city '{}'", name);
    }

    println!(
        "🗺️  Found {} city grid(s) in {}",
        cities.len(),
        config.general.grid_dir.display()
    );

    // Handle --dry-run: list cities and exit
    if args.dry_run {
        return handle_dry_run(&cities, &config.grid.accepted_crs);
    }

    // Step 2: Build the client
    let transport = Arc::new(HttpTransport::new(config.query.timeout_seconds)?);
    let client = Arc::new(
        QueryClient::new(transport, config.query.base_url.clone(), config.retry_policy())
            .with_filter(config.filter()),
    );

    println!("🌐 Querying {}", config.query.base_url);
    println!("   Interval: {}", settings.interval);
    println!("   Workers: {}", settings.max_workers);
    println!(
        "   Retries: {} (backoff unit {}ms)",
        config.query.max_retries, config.query.retry_base_delay_ms
    );

    let sink = FileSink::new(
        &config.general.output_dir,
        settings.top_k,
        args.format.into(),
    )?;

    // Step 3: One city at a time
    let mut digests = Vec::new();
    let mut failed_cities = Vec::new();

    for source in &cities {
        match process_source(&client, source, &settings, &config, &sink, args.quiet).await {
            Ok(digest) => digests.push(digest),
            Err(failure) => {
                eprintln!("   ⛔ {}: {}", failure.city, failure.error);
                failed_cities.push(failure);
            }
        }
    }

    // Step 4: Summary and report
    println!("\n📝 Writing summary and report...");

    let report = RunReport {
        metadata: RunMetadata {
            started_at,
            base_url: config.query.base_url.clone(),
            interval: settings.interval.to_string(),
            top_k: settings.top_k,
            max_workers: settings.max_workers,
            cities_processed: digests.len(),
            cities_failed: failed_cities.len(),
            duration_seconds: start_time.elapsed().as_secs_f64(),
        },
        cities: digests,
        failed_cities,
    };

    sink.write_summary(&report.summary_rows())?;
    sink.write_run_report(&report)?;

    println!("\n📊 Run Summary:");
    println!("   Cities processed: {}", report.metadata.cities_processed);
    println!("   Cities failed: {}", report.metadata.cities_failed);
    println!("   Duration: {:.1}s", report.metadata.duration_seconds);
    println!(
        "\n✅ Done! Results saved to: {}",
        config.general.output_dir.display()
    );

    if args.fail_on_city_error && !report.failed_cities.is_empty() {
        eprintln!(
            "\n⛔ {} city(ies) could not be processed. Failing (exit code 2).",
            report.failed_cities.len()
        );
        return Ok(2);
    }

    Ok(0)
}

/// Load, query and persist one city.
///
/// Grid and output problems are turned into a [`CityFailure`] so the run
/// moves on to the next city.
async fn process_source(
    client: &Arc<QueryClient<HttpTransport>>,
    source: &CitySource,
    settings: &PipelineSettings,
    config: &Config,
    sink: &FileSink,
    quiet: bool,
) -> Result<CityDigest, CityFailure> {
    let fail = |error: String| CityFailure {
        city: source.name.clone(),
        error,
    };

    println!("\n🏙️  {}", source.name);

    let cells = grid::load_grid(source, &config.grid.accepted_crs).map_err(|e| {
        error!(city = %source.name, error = %e, "Skipping city");
        fail(e.to_string())
    })?;
    println!("   {} cells", cells.len());

    let progress = (!quiet).then(|| progress_bar(cells.len() as u64));
    let run = CityRun {
        city: source.name.clone(),
        cells,
    };
    let result = process_city(Arc::clone(client), run, settings, progress.as_ref()).await;
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    let report = &result.report;
    sink.write_city(report).map_err(|e| fail(format!("{:#}", e)))?;
    for (cell_id, series) in &result.timeseries {
        if let Err(e) = sink.write_timeseries(&report.city, *cell_id, series) {
            warn!(city = %report.city, cell = *cell_id, "Failed to write time series: {:#}", e);
        }
    }

    let failed = report.failed_cells().count();
    println!(
        "   Total activity: {} | Max: {} | Failed cells: {}",
        report.summary.total, report.summary.max, failed
    );

    Ok(CityDigest::from(report))
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Handle --dry-run: load every grid, print cell counts, exit.
fn handle_dry_run(cities: &[CitySource], accepted_crs: &[String]) -> Result<i32> {
    println!("\n🔍 Dry run: loading grids (no API calls)...\n");

    let mut total = 0;
    for source in cities {
        match grid::load_grid(source, accepted_crs) {
            Ok(cells) => {
                total += cells.len();
                println!("     📄 {} ({} cells)", source.name, cells.len());
            }
            Err(e) => println!("     ⛔ {}: {}", source.name, e),
        }
    }

    println!("\n   Total: {} cells would be queried", total);
    println!("\n✅ Dry run complete. No API calls were made.");
    Ok(0)
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
