//! The recipe-executor seam and its result model.
//!
//! The core never interprets verb semantics; it hands a recipe and one tile's
//! sub-extent to a [`QueryEngine`] and gets back named, dimension-labelled
//! arrays. Implementations must open their own engine session per invocation
//! so a failing or resource-exhausted execution cannot corrupt a sibling
//! tile's execution.

use crate::crs::Bounds;
use crate::error::TileError;
use crate::partition::Tile;
use crate::recipe::{output_shape, Recipe};
use async_trait::async_trait;
use chrono::Datelike;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element type of a result array as produced by the engine.
///
/// Values travel through the core as f64; the declared dtype is carried along
/// for merge compatibility checks and artifact metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Uint8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::Uint8 => "uint8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        };
        write!(f, "{}", s)
    }
}

/// Label of one array axis.
///
/// Non-spatial axes carry the coordinate labels for each index (time stamps,
/// group keys, band names); spatial axes are implied by the array bounds and
/// resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum DimLabel {
    Y,
    X,
    Time(Vec<String>),
    Group(Vec<String>),
    Band(Vec<String>),
}

impl DimLabel {
    pub fn is_spatial(&self) -> bool {
        matches!(self, DimLabel::Y | DimLabel::X)
    }

    /// Coordinate labels for non-spatial axes.
    pub fn labels(&self) -> Option<&[String]> {
        match self {
            DimLabel::Y | DimLabel::X => None,
            DimLabel::Time(l) | DimLabel::Group(l) | DimLabel::Band(l) => Some(l),
        }
    }
}

/// One named result for one tile: an array annotated with its axes and grid.
#[derive(Debug, Clone)]
pub struct ResultArray {
    pub data: ArrayD<f64>,
    pub dims: Vec<DimLabel>,
    pub dtype: DataType,

    /// Spatial bounds of the array in the grid CRS.
    pub bounds: Bounds,
    pub resolution: f64,
    pub crs: String,
}

impl ResultArray {
    /// Check internal consistency: one label per axis and label lengths
    /// matching the axis sizes.
    pub fn validate(&self) -> Result<(), String> {
        if self.dims.len() != self.data.ndim() {
            return Err(format!(
                "array has {} axes but {} dim labels",
                self.data.ndim(),
                self.dims.len()
            ));
        }
        for (axis, dim) in self.dims.iter().enumerate() {
            if let Some(labels) = dim.labels() {
                if labels.len() != self.data.shape()[axis] {
                    return Err(format!(
                        "axis {} has size {} but {} labels",
                        axis,
                        self.data.shape()[axis],
                        labels.len()
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn has_spatial_axes(&self) -> bool {
        self.dims.iter().any(|d| d.is_spatial())
    }
}

/// All named results for one tile. The key set must equal the recipe's
/// output-name set; the scheduler rejects partial results.
pub type TileResult = BTreeMap<String, ResultArray>;

/// The external query engine, seen from the scheduler.
///
/// Implementations are treated as pure functions of (recipe, tile): each call
/// opens and closes its own engine session, performs no writes, and reports
/// every failure as a [`TileError::Execution`] so the scheduler can retry it.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(&self, recipe: &Recipe, tile: &Tile) -> Result<TileResult, TileError>;
}

/// Deterministic in-memory engine.
///
/// Generates gradient data whose value depends only on the pixel's position
/// in the grid CRS, never on tile boundaries, so merged tiled runs are
/// bit-comparable with unpartitioned runs. Used by integration tests and the
/// CLI smoke path; real deployments implement [`QueryEngine`] against an
/// actual query engine.
pub struct SyntheticEngine {
    resolution: f64,
    crs: String,
}

impl SyntheticEngine {
    pub fn new(resolution: f64, crs: impl Into<String>) -> Self {
        Self {
            resolution,
            crs: crs.into(),
        }
    }

    /// Month keys ("YYYY-MM") covered by a tile's time range.
    fn month_labels(tile: &Tile) -> Vec<String> {
        let mut labels = Vec::new();
        let mut year = tile.time.start.year();
        let mut month = tile.time.start.month();
        loop {
            let first = chrono::NaiveDate::from_ymd_opt(year, month, 1)
                .expect("first of month is always valid");
            if first >= tile.time.end {
                break;
            }
            // Skip the month before the range start for mid-month starts
            if first >= tile.time.start
                || (year == tile.time.start.year() && month == tile.time.start.month())
            {
                labels.push(format!("{:04}-{:02}", year, month));
            }
            month += 1;
            if month > 12 {
                month = 1;
                year += 1;
            }
        }
        labels
    }

    fn raster_shape(&self, tile: &Tile) -> (usize, usize) {
        let height = ((tile.bounds[3] - tile.bounds[1]) / self.resolution).round() as usize;
        let width = ((tile.bounds[2] - tile.bounds[0]) / self.resolution).round() as usize;
        (height.max(1), width.max(1))
    }

    /// Gradient value at a pixel centre, layered by band index.
    fn value_at(&self, tile: &Tile, row: usize, col: usize, band: usize) -> f64 {
        let x = tile.bounds[0] + (col as f64 + 0.5) * self.resolution;
        let y = tile.bounds[3] - (row as f64 + 0.5) * self.resolution;
        x + y + band as f64 * 1000.0
    }
}

#[async_trait]
impl QueryEngine for SyntheticEngine {
    async fn execute(&self, recipe: &Recipe, tile: &Tile) -> Result<TileResult, TileError> {
        let mut result = TileResult::new();

        for (name, expr) in recipe.iter() {
            let shape = output_shape(expr);
            let (height, width) = self.raster_shape(tile);

            let array = if shape.spatial {
                let bands: Option<DimLabel> = if shape.grouped {
                    Some(DimLabel::Group(Self::month_labels(tile)))
                } else if shape.temporal {
                    Some(DimLabel::Time(Self::month_labels(tile)))
                } else {
                    None
                };

                match bands {
                    Some(band_dim) => {
                        let n = band_dim.labels().map(|l| l.len()).unwrap_or(0).max(1);
                        let mut data = ArrayD::zeros(IxDyn(&[n, height, width]));
                        for b in 0..n {
                            for r in 0..height {
                                for c in 0..width {
                                    data[[b, r, c]] = self.value_at(tile, r, c, b);
                                }
                            }
                        }
                        ResultArray {
                            data,
                            dims: vec![band_dim, DimLabel::Y, DimLabel::X],
                            dtype: DataType::Float64,
                            bounds: tile.bounds,
                            resolution: self.resolution,
                            crs: self.crs.clone(),
                        }
                    }
                    None => {
                        let mut data = ArrayD::zeros(IxDyn(&[height, width]));
                        for r in 0..height {
                            for c in 0..width {
                                data[[r, c]] = self.value_at(tile, r, c, 0);
                            }
                        }
                        ResultArray {
                            data,
                            dims: vec![DimLabel::Y, DimLabel::X],
                            dtype: DataType::Float64,
                            bounds: tile.bounds,
                            resolution: self.resolution,
                            crs: self.crs.clone(),
                        }
                    }
                }
            } else {
                // Non-spatial output: a labelled series (time or group), or a
                // single value when everything was reduced away.
                let labels = if shape.temporal || shape.grouped {
                    Self::month_labels(tile)
                } else {
                    vec!["value".to_string()]
                };
                let n = labels.len().max(1);
                let mut data = ArrayD::zeros(IxDyn(&[n]));
                for (i, v) in data.iter_mut().enumerate() {
                    *v = (tile.bounds[0] + tile.bounds[1]) / 2.0 + i as f64;
                }
                let dim = if shape.grouped {
                    DimLabel::Group(labels)
                } else if shape.temporal {
                    DimLabel::Time(labels)
                } else {
                    DimLabel::Band(labels)
                };
                ResultArray {
                    data,
                    dims: vec![dim],
                    dtype: DataType::Float64,
                    bounds: tile.bounds,
                    resolution: self.resolution,
                    crs: self.crs.clone(),
                }
            };

            array
                .validate()
                .map_err(|e| TileError::Execution(format!("synthetic result invalid: {}", e)))?;
            result.insert(name.to_string(), array);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::TimeRange;
    use crate::recipe::parse_recipe;
    use chrono::NaiveDate;
    use serde_json::json;

    fn tile(bounds: Bounds) -> Tile {
        Tile {
            tile_id: "x0_y0_20200101-20210101".to_string(),
            bounds,
            core_bounds: bounds,
            time: TimeRange::new(
                NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            )
            .unwrap(),
        }
    }

    fn reduce_recipe() -> Recipe {
        parse_recipe(&json!({
            "composite": {
                "type": "processing_chain",
                "with": {"type": "layer", "reference": ["l"]},
                "do": [{"type": "verb", "name": "reduce",
                        "params": {"reducer": "median", "dimension": "time"}}]
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_synthetic_engine_produces_all_outputs() {
        let engine = SyntheticEngine::new(1.0, "EPSG:3857");
        let result = engine
            .execute(&reduce_recipe(), &tile([0.0, 0.0, 4.0, 4.0]))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        let arr = &result["composite"];
        assert_eq!(arr.data.shape(), &[4, 4]);
        assert!(arr.has_spatial_axes());
    }

    #[tokio::test]
    async fn test_synthetic_values_are_position_dependent() {
        let engine = SyntheticEngine::new(1.0, "EPSG:3857");
        let recipe = reduce_recipe();

        // The same world pixel must get the same value from different tiles
        let left = engine
            .execute(&recipe, &tile([0.0, 0.0, 4.0, 4.0]))
            .await
            .unwrap();
        let wide = engine
            .execute(&recipe, &tile([0.0, 0.0, 8.0, 4.0]))
            .await
            .unwrap();

        let a = &left["composite"].data;
        let b = &wide["composite"].data;
        assert_eq!(a[[0, 0]], b[[0, 0]]);
        assert_eq!(a[[3, 3]], b[[3, 3]]);
    }

    #[tokio::test]
    async fn test_synthetic_grouped_output_has_month_labels() {
        let recipe = parse_recipe(&json!({
            "monthly": {
                "type": "processing_chain",
                "with": {"type": "layer", "reference": ["l"]},
                "do": [
                    {"type": "verb", "name": "groupby", "params": {"grouper": {
                        "type": "processing_chain",
                        "with": {"type": "self"},
                        "do": [{"type": "verb", "name": "extract",
                                "params": {"dimension": "time", "component": "month"}}]
                    }}},
                    {"type": "verb", "name": "reduce",
                     "params": {"reducer": "mean", "dimension": "time"}}
                ]
            }
        }))
        .unwrap();

        let engine = SyntheticEngine::new(1.0, "EPSG:3857");
        let result = engine
            .execute(&recipe, &tile([0.0, 0.0, 2.0, 2.0]))
            .await
            .unwrap();
        let arr = &result["monthly"];
        match &arr.dims[0] {
            DimLabel::Group(labels) => {
                assert_eq!(labels.len(), 12);
                assert_eq!(labels[0], "2020-01");
                assert_eq!(labels[11], "2020-12");
            }
            other => panic!("expected group axis, got {:?}", other),
        }
    }

    #[test]
    fn test_result_array_validate_rejects_label_mismatch() {
        let arr = ResultArray {
            data: ArrayD::zeros(IxDyn(&[2, 2, 2])),
            dims: vec![
                DimLabel::Group(vec!["a".to_string()]),
                DimLabel::Y,
                DimLabel::X,
            ],
            dtype: DataType::Float64,
            bounds: [0.0, 0.0, 2.0, 2.0],
            resolution: 1.0,
            crs: "EPSG:3857".to_string(),
        };
        assert!(arr.validate().is_err());
    }
}
