//! tilequery CLI
//!
//! Partition, schedule and merge tiled recipe runs from a configuration file.
//! The `run` subcommand drives the built-in synthetic engine, which is enough
//! to smoke-test a configuration end to end; real query engines integrate
//! through the library's `QueryEngine` trait.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tilequery::{build_runtime, plan, run, RunConfig, SyntheticEngine};

#[derive(Parser)]
#[command(name = "tilequery")]
#[command(about = "Tiled execution of declarative raster query recipes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override worker count
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recipe over the configured extent (default command)
    Run,

    /// Estimate the work without processing
    Plan,

    /// Validate configuration and recipe
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => run_command(cli.config, cli.workers)?,
        Some(Commands::Plan) => plan_command(cli.config)?,
        Some(Commands::Validate) => validate_command(cli.config)?,
        Some(Commands::GenerateConfig { output }) => generate_config_command(output)?,
    }

    Ok(())
}

fn run_command(config_path: PathBuf, workers: Option<usize>) -> Result<()> {
    let mut config = RunConfig::from_file(&config_path)?;

    if let Some(w) = workers {
        config.processing.max_workers = w;
    }

    config.validate()?;

    let runtime = build_runtime(None)?;
    runtime.block_on(async {
        let engine = Arc::new(SyntheticEngine::new(
            config.grid.resolution,
            config.grid.crs.clone(),
        ));
        let summary = run(&config, engine).await?;

        tracing::info!("Manifest: {}", summary.manifest);
        for path in &summary.report.artifacts {
            tracing::info!("Artifact: {}", path.display());
        }
        for (output, error) in &summary.report.errors {
            tracing::error!("Output '{}' failed to merge: {}", output, error);
        }
        if !summary.manifest.is_fully_successful() {
            let failed: Vec<&str> = summary.manifest.failed_ids().collect();
            tracing::warn!("Failed tiles: {}", failed.join(", "));
        }
        anyhow::Ok(())
    })?;

    Ok(())
}

fn plan_command(config_path: PathBuf) -> Result<()> {
    let config = RunConfig::from_file(&config_path)?;
    let estimate = plan(&config)?;

    println!("\n=== Work Estimate ===");
    print!("{}", estimate);
    println!("=====================\n");

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = RunConfig::from_file(&config_path)?;
    config.validate()?;
    let recipe = config.load_recipe()?;
    println!(
        "Configuration is valid ({} outputs: {})",
        recipe.len(),
        recipe.output_names().join(", ")
    );
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# tilequery run configuration

# Recipe document: output names mapped to verb chains (JSON)
recipe_path: recipe.json

# === EXTENT: what to process ===
extent:
  geometry:
    type: bbox
    bounds: [10.0, 45.0, 11.0, 46.0]
  # CRS of the geometry coordinates
  crs: "EPSG:4326"
  time:
    start: 2020-01-01
    end: 2022-01-01

# === GRID: the run's target grid ===
grid:
  # EPSG:6933 is EASE-Grid 2.0 (equal-area, global)
  crs: "EPSG:6933"
  # Pixel size in CRS units
  resolution: 10.0

# === TILING ===
tiling:
  # Tile edge length in pixels
  tile_size: 1024
  # Overlap margin in pixels (0 = disjoint tiles)
  margin: 0
  # Calendar chunking of the time range: whole | year | month
  temporal_chunk: year

# === PROCESSING ===
processing:
  max_workers: 8
  max_retries: 3
  initial_backoff_ms: 100
  max_backoff_ms: 10000
  # Progress reporting interval in seconds
  metrics_interval_secs: 10

# === OUTPUTS: per-output merge behaviour ===
# Modes: merge (one mosaic per group), vrt (per-tile files + index),
# none (per-tile files). merge mode requires an explicit overlap policy
# (last_wins or average).
merge_defaults:
  mode: merge
  overlap: last_wins

# outputs:
#   ndvi_composite:
#     mode: vrt

# === OUTPUT DIRECTORY ===
# Required for vrt and none modes; merged outputs are also written here
# when set.
output:
  dir: results
  compression_level: 3
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
