//! Run configuration for tiled recipe execution.

use crate::error::ValidationError;
use crate::extent::{SpatialExtent, SpatioTemporalExtent, TimeRange};
use crate::merge::{MergeMode, MergeSpec, OverlapPolicy};
use crate::partition::TilePolicy;
use crate::recipe::{parse_recipe, Recipe};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Path to the recipe document (JSON)
    pub recipe_path: PathBuf,

    /// Spatio-temporal extent to evaluate the recipe over
    pub extent: ExtentConfig,

    /// Target grid the run is evaluated on
    #[serde(default)]
    pub grid: GridConfig,

    /// Tiling policy
    #[serde(default)]
    pub tiling: TilePolicy,

    /// Worker pool configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Per-output merge specs; outputs not listed use `merge_defaults`
    #[serde(default)]
    pub outputs: BTreeMap<String, MergeSpec>,

    /// Fallback merge spec for outputs without an explicit entry
    #[serde(default)]
    pub merge_defaults: MergeDefaults,

    /// Artifact output configuration
    #[serde(default)]
    pub output: OutputConfig,
}

/// Extent as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtentConfig {
    /// Area of interest
    #[serde(flatten)]
    pub space: SpatialExtent,

    /// Time range `[start, end)`
    pub time: TimeRangeConfig,
}

/// Time range fields, validated in `RunConfig::validate`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRangeConfig {
    pub start: chrono::NaiveDate,
    pub end: chrono::NaiveDate,
}

/// The grid every tile and artifact of the run lives on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Grid CRS (default: EPSG:6933, equal-area)
    #[serde(default = "default_grid_crs")]
    pub crs: String,

    /// Pixel size in CRS units
    #[serde(default = "default_resolution")]
    pub resolution: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            crs: default_grid_crs(),
            resolution: default_resolution(),
        }
    }
}

/// Worker pool and reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of concurrent workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Times a failed tile is re-queued before it is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial retry backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Un-merged results held in flight, as a multiple of `max_workers`
    #[serde(default = "default_result_buffer_factor")]
    pub result_buffer_factor: usize,

    /// Consecutive failures after which a worker is recycled
    #[serde(default = "default_recycle_threshold")]
    pub recycle_threshold: usize,

    /// Enable periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save a metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            result_buffer_factor: default_result_buffer_factor(),
            recycle_threshold: default_recycle_threshold(),
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Fallback merge behaviour for outputs without an explicit spec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MergeDefaults {
    #[serde(default = "default_merge_mode")]
    pub mode: MergeMode,

    /// No default on purpose: `merge` mode requires an explicit choice.
    #[serde(default)]
    pub overlap: Option<OverlapPolicy>,
}

impl Default for MergeDefaults {
    fn default() -> Self {
        Self {
            mode: default_merge_mode(),
            overlap: None,
        }
    }
}

/// Where and how artifacts are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory. May be omitted when every output uses `merge` mode
    /// (results are then returned in memory only).
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Zstd compression level (0-22) for artifacts
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: None,
            compression_level: default_compression_level(),
        }
    }
}

impl RunConfig {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from the file extension (.yaml, .yml, .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: RunConfig = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Structural validation, before the recipe is even loaded.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.grid.resolution <= 0.0 {
            return Err(ValidationError::Config(format!(
                "grid resolution must be positive, got {}",
                self.grid.resolution
            )));
        }
        if self.processing.max_workers == 0 {
            return Err(ValidationError::Config(
                "max_workers must be > 0".to_string(),
            ));
        }
        if self.tiling.tile_size == 0 {
            return Err(ValidationError::Config("tile_size must be > 0".to_string()));
        }
        if self.output.compression_level < 0 || self.output.compression_level > 22 {
            return Err(ValidationError::Config(
                "compression_level must be 0-22 for zstd".to_string(),
            ));
        }
        // Re-assert the TimeRange invariant, since serde bypasses the constructor
        TimeRange::new(self.extent.time.start, self.extent.time.end)?;
        Ok(())
    }

    /// The validated spatio-temporal extent.
    pub fn extent(&self) -> Result<SpatioTemporalExtent, ValidationError> {
        Ok(SpatioTemporalExtent {
            space: self.extent.space.clone(),
            time: TimeRange::new(self.extent.time.start, self.extent.time.end)?,
        })
    }

    /// Load and parse the recipe document.
    pub fn load_recipe(&self) -> Result<Recipe, ValidationError> {
        let contents = std::fs::read_to_string(&self.recipe_path).map_err(|e| {
            ValidationError::Config(format!(
                "cannot read recipe {}: {}",
                self.recipe_path.display(),
                e
            ))
        })?;
        let doc: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
            ValidationError::Recipe {
                path: "$".to_string(),
                message: format!("invalid JSON: {}", e),
            }
        })?;
        parse_recipe(&doc)
    }

    /// The effective merge spec for every recipe output.
    pub fn merge_specs(&self, recipe: &Recipe) -> BTreeMap<String, MergeSpec> {
        recipe
            .output_names()
            .into_iter()
            .map(|name| {
                let spec = self.outputs.get(name).copied().unwrap_or(MergeSpec {
                    mode: self.merge_defaults.mode,
                    overlap: self.merge_defaults.overlap,
                });
                (name.to_string(), spec)
            })
            .collect()
    }
}

// Default value functions for serde
fn default_grid_crs() -> String { "EPSG:6933".to_string() }
fn default_resolution() -> f64 { 10.0 }
fn default_max_workers() -> usize { 8 }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_result_buffer_factor() -> usize { 2 }
fn default_recycle_threshold() -> usize { 3 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_merge_mode() -> MergeMode { MergeMode::Merge }
fn default_compression_level() -> i32 { 3 }

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
recipe_path: recipe.json
extent:
  geometry:
    type: bbox
    bounds: [10.0, 45.0, 11.0, 46.0]
  crs: "EPSG:4326"
  time:
    start: 2020-01-01
    end: 2021-01-01
"#;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = RunConfig::from_yaml(MINIMAL_YAML).unwrap();
        assert_eq!(config.grid.crs, "EPSG:6933");
        assert_eq!(config.grid.resolution, 10.0);
        assert_eq!(config.processing.max_workers, 8);
        assert_eq!(config.tiling.tile_size, 1024);
        assert!(config.output.dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_inverted_time_range() {
        let yaml = MINIMAL_YAML.replace("end: 2021-01-01", "end: 2019-01-01");
        let config = RunConfig::from_yaml(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        let mut config = RunConfig::from_yaml(MINIMAL_YAML).unwrap();
        config.processing.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_bad_compression() {
        let mut config = RunConfig::from_yaml(MINIMAL_YAML).unwrap();
        config.output.compression_level = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_per_output_specs_with_defaults() {
        let yaml = format!(
            "{}\noutputs:\n  ndvi:\n    mode: vrt\nmerge_defaults:\n  mode: merge\n  overlap: average\n",
            MINIMAL_YAML
        );
        let config = RunConfig::from_yaml(&yaml).unwrap();

        let recipe = crate::recipe::parse_recipe(&serde_json::json!({
            "ndvi": {"type": "layer", "reference": ["l"]},
            "count": {"type": "layer", "reference": ["l"]}
        }))
        .unwrap();

        let specs = config.merge_specs(&recipe);
        assert_eq!(specs["ndvi"].mode, MergeMode::Vrt);
        assert_eq!(specs["count"].mode, MergeMode::Merge);
        assert_eq!(specs["count"].overlap, Some(OverlapPolicy::Average));
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let config = RunConfig::from_yaml(MINIMAL_YAML).unwrap();
        let yaml = config.to_yaml().unwrap();
        let back = RunConfig::from_yaml(&yaml).unwrap();
        assert_eq!(back.grid.crs, config.grid.crs);
        assert_eq!(back.extent.time.start, config.extent.time.start);
    }
}
