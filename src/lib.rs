//! tilequery
//!
//! Evaluates a declarative analytical recipe (a tree of filter/reduce/
//! groupby/concatenate/extract verbs over spatio-temporal raster data) across
//! extents too large to process in one pass, by partitioning the extent into
//! tiles, executing the recipe per tile on a bounded worker pool, and merging
//! the per-tile results back into coherent artifacts.
//!
//! # Architecture
//!
//! - **partition**: splits the extent into disjoint tiles with deterministic ids
//! - **executor**: the query-engine seam producing named arrays per tile
//! - **scheduler**: pull-based worker pool with retries, stop control and a manifest
//! - **merge**: per-output recombination (mosaic, vrt index, or per-tile artifacts)
//! - **write**: idempotent Zarr artifact persistence
//!
//! Data flows partition → scheduler → (executor per tile) → merge → write.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tilequery::{run, RunConfig, SyntheticEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::from_file(&"config.yaml".into())?;
//!     let engine = Arc::new(SyntheticEngine::new(
//!         config.grid.resolution,
//!         config.grid.crs.clone(),
//!     ));
//!     let summary = run(&config, engine).await?;
//!     tracing::info!("{}", summary.manifest);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crs;
pub mod error;
pub mod executor;
pub mod extent;
pub mod merge;
pub mod metrics;
pub mod partition;
pub mod recipe;
pub mod scheduler;
pub mod write;

#[cfg(test)]
mod run_integration_tests;

pub use config::RunConfig;
pub use error::{MergeError, RunError, TileError, ValidationError};
pub use executor::{QueryEngine, SyntheticEngine};
pub use merge::{MergeMode, MergeReport, MergeSpec, OverlapPolicy};
pub use metrics::{Metrics, MetricsReporter};
pub use partition::{partition, Tile, TilePolicy};
pub use recipe::Recipe;
pub use scheduler::{Manifest, SchedulerConfig, StopHandle, StopMode, StopSignal, TileScheduler};

use crate::crs::ProjCache;
use crate::merge::{OutputGridSpec, ResultMerger};
use crate::recipe::{output_shape, tile_dims};
use crate::write::OutputWriter;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything one run produced.
#[derive(Debug)]
pub struct RunSummary {
    /// Per-tile accounting (always complete, including failed tiles).
    pub manifest: Manifest,

    /// Merged outputs, artifact paths and per-output merge errors.
    pub report: MergeReport,
}

/// Execute a full run: validate, partition, schedule, merge, write.
///
/// Per-tile and per-output failures are isolated and reported in the summary;
/// only validation errors (raised before any tile is dispatched) and output
/// directory setup failures abort the run.
pub async fn run(config: &RunConfig, engine: Arc<dyn QueryEngine>) -> Result<RunSummary, RunError> {
    run_with_stop(config, engine, StopSignal::inert()).await
}

/// [`run`] with an external stop signal (see [`StopHandle`]).
pub async fn run_with_stop(
    config: &RunConfig,
    engine: Arc<dyn QueryEngine>,
    stop: StopSignal,
) -> Result<RunSummary, RunError> {
    config.validate()?;
    let recipe = Arc::new(config.load_recipe()?);
    let extent = config.extent()?;
    let specs = config.merge_specs(&recipe);

    validate_merge_specs(&recipe, &specs, config)?;

    let cache = ProjCache::new();
    let dims = tile_dims(&recipe);
    let tiles = partition(
        &extent,
        &config.tiling,
        config.grid.resolution,
        &config.grid.crs,
        dims,
        &cache,
    )?;

    let metrics = Metrics::new();

    // Progress reporting, shut down over a channel once the run completes
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter_handle = if config.processing.enable_metrics {
        let reporter = MetricsReporter::new(
            metrics.clone(),
            config.processing.metrics_interval_secs,
            tiles.len() as u64,
        );
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        drop(shutdown_rx);
        None
    };

    let writer = match &config.output.dir {
        Some(dir) => Some(Arc::new(
            OutputWriter::create(dir, config.output.compression_level, metrics.clone())
                .await
                .map_err(|e| RunError::Io(format!("{:#}", e)))?,
        )),
        None => None,
    };

    // The mosaic canvas is aligned to the tile grid, whose union covers the
    // extent's bounding box
    let grid_spec = OutputGridSpec {
        bounds: tiles_union_bounds(&tiles),
        resolution: config.grid.resolution,
        crs: config.grid.crs.clone(),
    };

    let scheduler = TileScheduler::new(
        engine,
        SchedulerConfig {
            max_workers: config.processing.max_workers,
            max_retries: config.processing.max_retries,
            initial_backoff_ms: config.processing.initial_backoff_ms,
            max_backoff_ms: config.processing.max_backoff_ms,
            result_buffer_factor: config.processing.result_buffer_factor,
            recycle_threshold: config.processing.recycle_threshold,
        },
        metrics.clone(),
    );

    let mut merger = ResultMerger::new(&specs, grid_spec, &tiles, writer, metrics.clone());

    // Completed tiles stream into the merger as they arrive; the bounded
    // channel keeps un-merged results to a small multiple of the worker count
    let (results_tx, mut results_rx) = scheduler.result_channel();
    let merge_task = tokio::spawn(async move {
        while let Some(completed) = results_rx.recv().await {
            merger.accept(completed).await;
        }
        merger.finalize().await
    });

    let manifest = scheduler.run(recipe, tiles, results_tx, stop).await;

    let report = merge_task
        .await
        .map_err(|e| RunError::Io(format!("merge stage panicked: {}", e)))?;

    let _ = shutdown_tx.send(()).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
        MetricsReporter::new(metrics.clone(), 0, manifest.total() as u64).print_summary();
    }

    if let Some(path) = &config.processing.metrics_output_path {
        if let Err(e) = metrics.snapshot().save_to_file(path) {
            tracing::warn!("Failed to save metrics to {}: {}", path, e);
        }
    }

    Ok(RunSummary { manifest, report })
}

/// Fail fast on merge specs that cannot work for the recipe's output shapes.
fn validate_merge_specs(
    recipe: &Recipe,
    specs: &BTreeMap<String, MergeSpec>,
    config: &RunConfig,
) -> Result<(), ValidationError> {
    for name in config.outputs.keys() {
        if recipe.get(name).is_none() {
            return Err(ValidationError::UnknownOutput {
                output: name.clone(),
            });
        }
    }

    for (name, spec) in specs {
        let expr = recipe.get(name).expect("specs are derived from the recipe");
        let shape = output_shape(expr);

        match spec.mode {
            MergeMode::Vrt => {
                if !shape.spatial {
                    return Err(ValidationError::VrtWithoutSpatialAxis {
                        output: name.clone(),
                    });
                }
                if config.output.dir.is_none() {
                    return Err(ValidationError::OutputDirRequired {
                        output: name.clone(),
                        mode: spec.mode.to_string(),
                    });
                }
            }
            MergeMode::None => {
                if config.output.dir.is_none() {
                    return Err(ValidationError::OutputDirRequired {
                        output: name.clone(),
                        mode: spec.mode.to_string(),
                    });
                }
            }
            MergeMode::Merge => {
                if spec.overlap.is_none() {
                    return Err(ValidationError::MissingOverlapPolicy {
                        output: name.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn tiles_union_bounds(tiles: &[Tile]) -> crs::Bounds {
    let mut bounds = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    for tile in tiles {
        bounds[0] = bounds[0].min(tile.core_bounds[0]);
        bounds[1] = bounds[1].min(tile.core_bounds[1]);
        bounds[2] = bounds[2].max(tile.core_bounds[2]);
        bounds[3] = bounds[3].max(tile.core_bounds[3]);
    }
    bounds
}

/// A dry-run work estimate, shown by the CLI before committing to a run.
#[derive(Debug)]
pub struct RunPlan {
    pub tile_count: usize,
    pub spatial_cells: usize,
    pub time_chunks: usize,
    pub outputs: Vec<OutputPlan>,
}

/// Work estimate for one output.
#[derive(Debug)]
pub struct OutputPlan {
    pub name: String,
    pub mode: MergeMode,
    pub has_spatial_axis: bool,
    pub artifact_count: usize,
    pub estimated_mb: f64,
}

impl std::fmt::Display for RunPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Tiles: {} ({} spatial cells x {} time chunks)",
            self.tile_count, self.spatial_cells, self.time_chunks
        )?;
        for output in &self.outputs {
            writeln!(
                f,
                "  {:<20} mode={:<5} artifacts={:<6} est. {:.1} MB",
                output.name,
                output.mode.to_string(),
                output.artifact_count,
                output.estimated_mb
            )?;
        }
        Ok(())
    }
}

/// Estimate the work a configuration implies without executing anything.
pub fn plan(config: &RunConfig) -> Result<RunPlan, RunError> {
    config.validate()?;
    let recipe = config.load_recipe()?;
    let extent = config.extent()?;
    let specs = config.merge_specs(&recipe);
    validate_merge_specs(&recipe, &specs, config)?;

    let cache = ProjCache::new();
    let dims = tile_dims(&recipe);
    let tiles = partition(
        &extent,
        &config.tiling,
        config.grid.resolution,
        &config.grid.crs,
        dims,
        &cache,
    )?;

    let mut time_keys: Vec<String> = tiles.iter().map(|t| t.time.key()).collect();
    time_keys.sort();
    time_keys.dedup();
    let time_chunks = time_keys.len();
    let spatial_cells = tiles.len() / time_chunks.max(1);

    let tile_px = config.tiling.tile_size * config.tiling.tile_size;
    let bytes_per_px = std::mem::size_of::<f64>();

    let outputs = specs
        .iter()
        .map(|(name, spec)| {
            let shape = output_shape(recipe.get(name).expect("spec derived from recipe"));
            let artifact_count = match spec.mode {
                MergeMode::Merge => 1,
                MergeMode::Vrt => tiles.len() + 1,
                MergeMode::None => tiles.len(),
            };
            let per_tile_px = if shape.spatial { tile_px } else { 1 };
            let estimated_mb =
                (tiles.len() * per_tile_px * bytes_per_px) as f64 / (1024.0 * 1024.0);
            OutputPlan {
                name: name.clone(),
                mode: spec.mode,
                has_spatial_axis: shape.spatial,
                artifact_count,
                estimated_mb,
            }
        })
        .collect();

    Ok(RunPlan {
        tile_count: tiles.len(),
        spatial_cells,
        time_chunks,
        outputs,
    })
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
