//! End-to-end runs over the synthetic engine.

use crate::config::{ExtentConfig, GridConfig, OutputConfig, RunConfig, TimeRangeConfig};
use crate::error::{RunError, TileError, ValidationError};
use crate::executor::{QueryEngine, SyntheticEngine, TileResult};
use crate::extent::{Geometry, SpatialExtent};
use crate::merge::{MergeMode, MergeSpec, OverlapPolicy};
use crate::partition::{TemporalChunk, Tile, TilePolicy};
use crate::recipe::Recipe;
use crate::{run, RunSummary};
use chrono::NaiveDate;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const CRS: &str = "EPSG:3857";

fn write_recipe(dir: &Path, doc: &serde_json::Value) -> std::path::PathBuf {
    let path = dir.join("recipe.json");
    std::fs::write(&path, serde_json::to_string_pretty(doc).unwrap()).unwrap();
    path
}

fn reduce_time_recipe() -> serde_json::Value {
    json!({
        "composite": {
            "type": "processing_chain",
            "with": {"type": "layer", "reference": ["source", "reflectance", "band04"]},
            "do": [{"type": "verb", "name": "reduce",
                    "params": {"reducer": "median", "dimension": "time"}}]
        }
    })
}

fn base_config(recipe_path: std::path::PathBuf, bounds: [f64; 4], tile_size: usize) -> RunConfig {
    RunConfig {
        recipe_path,
        extent: ExtentConfig {
            space: SpatialExtent {
                geometry: Geometry::Bbox { bounds },
                crs: CRS.to_string(),
            },
            time: TimeRangeConfig {
                start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            },
        },
        grid: GridConfig {
            crs: CRS.to_string(),
            resolution: 1.0,
        },
        tiling: TilePolicy {
            tile_size,
            temporal_chunk: TemporalChunk::Whole,
            ..TilePolicy::default()
        },
        processing: crate::config::ProcessingConfig {
            max_workers: 4,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            enable_metrics: false,
            ..crate::config::ProcessingConfig::default()
        },
        outputs: Default::default(),
        merge_defaults: crate::config::MergeDefaults {
            mode: MergeMode::Merge,
            overlap: Some(OverlapPolicy::LastWins),
        },
        output: OutputConfig::default(),
    }
}

fn engine(config: &RunConfig) -> Arc<SyntheticEngine> {
    Arc::new(SyntheticEngine::new(
        config.grid.resolution,
        config.grid.crs.clone(),
    ))
}

async fn run_ok(config: &RunConfig) -> RunSummary {
    run(config, engine(config)).await.unwrap()
}

#[tokio::test]
async fn test_tiled_merge_equals_unpartitioned_reference() {
    let dir = TempDir::new().unwrap();
    let recipe_path = write_recipe(dir.path(), &reduce_time_recipe());

    // Two tiles side by side
    let tiled = base_config(recipe_path.clone(), [0.0, 0.0, 8.0, 4.0], 4);
    let tiled_summary = run_ok(&tiled).await;
    assert_eq!(tiled_summary.manifest.succeeded.len(), 2);

    // Reference: the same extent as one tile
    let reference = base_config(recipe_path, [0.0, 0.0, 8.0, 4.0], 8);
    let reference_summary = run_ok(&reference).await;
    assert_eq!(reference_summary.manifest.succeeded.len(), 1);

    let merged = &tiled_summary.report.merged["composite"];
    let expected = &reference_summary.report.merged["composite"];
    assert_eq!(merged.data.dim(), expected.data.dim());
    for (a, b) in merged.data.iter().zip(expected.data.iter()) {
        assert!(
            (a - b).abs() < 1e-9,
            "tiled result diverges from unpartitioned reference: {} vs {}",
            a,
            b
        );
    }
}

#[tokio::test]
async fn test_group_axis_covers_all_year_month_pairs() {
    let dir = TempDir::new().unwrap();
    let recipe_path = write_recipe(
        dir.path(),
        &json!({
            "monthly": {
                "type": "processing_chain",
                "with": {"type": "layer", "reference": ["source", "reflectance", "band04"]},
                "do": [
                    {"type": "verb", "name": "groupby", "params": {"grouper": {
                        "type": "collection",
                        "elements": [
                            {"type": "processing_chain", "with": {"type": "self"},
                             "do": [{"type": "verb", "name": "extract",
                                     "params": {"dimension": "time", "component": "year"}}]},
                            {"type": "processing_chain", "with": {"type": "self"},
                             "do": [{"type": "verb", "name": "extract",
                                     "params": {"dimension": "time", "component": "month"}}]}
                        ]
                    }}},
                    {"type": "verb", "name": "reduce",
                     "params": {"reducer": "mean", "dimension": "time"}}
                ]
            }
        }),
    );

    // Two years of data over two spatial tiles
    let mut config = base_config(recipe_path, [0.0, 0.0, 8.0, 4.0], 4);
    config.extent.time.end = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();

    let summary = run_ok(&config).await;
    assert!(summary.report.errors.is_empty());

    let merged = &summary.report.merged["monthly"];
    assert_eq!(
        merged.bands.len(),
        24,
        "group axis must cover every distinct (year, month) pair"
    );
    assert_eq!(merged.bands[0], "2020-01");
    assert_eq!(merged.bands[23], "2021-12");
}

#[tokio::test]
async fn test_vrt_for_pure_timeseries_rejected_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let recipe_path = write_recipe(
        dir.path(),
        &json!({
            "series": {
                "type": "processing_chain",
                "with": {"type": "layer", "reference": ["source", "reflectance", "band04"]},
                "do": [{"type": "verb", "name": "reduce",
                        "params": {"reducer": "mean", "dimension": "space"}}]
            }
        }),
    );

    let mut config = base_config(recipe_path, [0.0, 0.0, 8.0, 4.0], 4);
    config.output.dir = Some(dir.path().join("results"));
    config.outputs.insert(
        "series".to_string(),
        MergeSpec {
            mode: MergeMode::Vrt,
            overlap: None,
        },
    );

    let err = run(&config, engine(&config)).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Validation(ValidationError::VrtWithoutSpatialAxis { .. })
    ));
    assert!(
        !dir.path().join("results").exists(),
        "validation failures must precede any dispatch or write"
    );
}

#[tokio::test]
async fn test_merge_without_overlap_policy_rejected() {
    let dir = TempDir::new().unwrap();
    let recipe_path = write_recipe(dir.path(), &reduce_time_recipe());

    let mut config = base_config(recipe_path, [0.0, 0.0, 8.0, 4.0], 4);
    config.merge_defaults.overlap = None;

    let err = run(&config, engine(&config)).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Validation(ValidationError::MissingOverlapPolicy { .. })
    ));
}

#[tokio::test]
async fn test_none_mode_yields_one_artifact_per_tile() {
    let dir = TempDir::new().unwrap();
    let recipe_path = write_recipe(dir.path(), &reduce_time_recipe());

    // 2x2 spatial tiles
    let mut config = base_config(recipe_path, [0.0, 0.0, 8.0, 8.0], 4);
    config.output.dir = Some(dir.path().join("results"));
    config.merge_defaults.mode = MergeMode::None;

    let summary = run_ok(&config).await;
    assert_eq!(summary.manifest.succeeded.len(), 4);
    assert_eq!(summary.report.artifacts.len(), 4);
    for path in &summary.report.artifacts {
        assert!(path.exists());
    }
}

#[tokio::test]
async fn test_vrt_mode_yields_index_over_tile_files() {
    let dir = TempDir::new().unwrap();
    let recipe_path = write_recipe(dir.path(), &reduce_time_recipe());

    let mut config = base_config(recipe_path, [0.0, 0.0, 8.0, 4.0], 4);
    config.output.dir = Some(dir.path().join("results"));
    config.merge_defaults.mode = MergeMode::Vrt;

    let summary = run_ok(&config).await;
    // 2 tile artifacts + 1 index
    assert_eq!(summary.report.artifacts.len(), 3);

    let index_path = dir.path().join("results").join("composite.vrt.json");
    assert!(index_path.exists());
    let index: crate::merge::VrtIndex =
        serde_json::from_str(&std::fs::read_to_string(index_path).unwrap()).unwrap();
    assert_eq!(index.tiles.len(), 2);
}

#[tokio::test]
async fn test_rerun_overwrites_instead_of_duplicating() {
    let dir = TempDir::new().unwrap();
    let recipe_path = write_recipe(dir.path(), &reduce_time_recipe());

    let mut config = base_config(recipe_path, [0.0, 0.0, 8.0, 4.0], 4);
    config.output.dir = Some(dir.path().join("results"));
    config.merge_defaults.mode = MergeMode::None;

    let first = run_ok(&config).await;
    let second = run_ok(&config).await;

    // Artifact paths are identical across runs (completion order may differ)
    let mut first_paths = first.report.artifacts.clone();
    let mut second_paths = second.report.artifacts.clone();
    first_paths.sort();
    second_paths.sort();
    assert_eq!(first_paths, second_paths);

    let artifact_dirs: Vec<_> = std::fs::read_dir(dir.path().join("results"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".zarr"))
        .collect();
    assert_eq!(artifact_dirs.len(), 2);
}

/// Delegates to the synthetic engine but permanently fails one tile.
struct OneBrokenTile {
    inner: SyntheticEngine,
    broken_prefix: String,
}

#[async_trait::async_trait]
impl QueryEngine for OneBrokenTile {
    async fn execute(&self, recipe: &Recipe, tile: &Tile) -> Result<TileResult, TileError> {
        if tile.tile_id.starts_with(&self.broken_prefix) {
            return Err(TileError::Execution("simulated engine crash".to_string()));
        }
        self.inner.execute(recipe, tile).await
    }
}

#[tokio::test]
async fn test_partial_failure_keeps_other_tiles_usable() {
    let dir = TempDir::new().unwrap();
    let recipe_path = write_recipe(dir.path(), &reduce_time_recipe());
    let config = base_config(recipe_path, [0.0, 0.0, 8.0, 4.0], 4);

    let engine = Arc::new(OneBrokenTile {
        inner: SyntheticEngine::new(1.0, CRS),
        broken_prefix: "x4_".to_string(),
    });

    let summary = run(&config, engine).await.unwrap();
    assert_eq!(summary.manifest.succeeded.len(), 1);
    assert_eq!(summary.manifest.failed.len(), 1);
    assert!(summary.manifest.failed[0].tile_id.starts_with("x4_"));

    // The surviving tile's half of the mosaic carries data; the failed half
    // stays NaN
    let merged = &summary.report.merged["composite"];
    assert!(!merged.data[[0, 0, 0]].is_nan());
    assert!(merged.data[[0, 0, 7]].is_nan());
}
