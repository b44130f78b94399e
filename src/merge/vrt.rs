//! Virtual index over per-tile artifacts.
//!
//! Instead of materialising a merged raster, `vrt` mode records each tile
//! file and its spatial placement in one JSON document per output, enough for
//! a reader to resolve any pixel to the tile artifact that carries it.

use crate::crs::Bounds;
use serde::{Deserialize, Serialize};

/// One referenced tile artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VrtTile {
    pub tile_id: String,

    /// Artifact path relative to the index file.
    pub path: String,

    /// Spatial bounds of the artifact in the index CRS.
    pub bounds: Bounds,
    pub width: usize,
    pub height: usize,

    /// Band labels of the artifact, if any.
    pub bands: Vec<String>,
}

/// Index document for one output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VrtIndex {
    pub output: String,
    pub crs: String,
    pub resolution: f64,

    /// Union bounds of all referenced tiles.
    pub bounds: Bounds,
    pub dtype: String,
    pub tiles: Vec<VrtTile>,
}

impl VrtIndex {
    /// Assemble an index from tile entries, deterministically ordered by
    /// tile id regardless of completion order.
    pub fn new(
        output: impl Into<String>,
        crs: impl Into<String>,
        resolution: f64,
        dtype: impl Into<String>,
        mut tiles: Vec<VrtTile>,
    ) -> Self {
        tiles.sort_by(|a, b| a.tile_id.cmp(&b.tile_id));

        let mut bounds = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
        for tile in &tiles {
            bounds[0] = bounds[0].min(tile.bounds[0]);
            bounds[1] = bounds[1].min(tile.bounds[1]);
            bounds[2] = bounds[2].max(tile.bounds[2]);
            bounds[3] = bounds[3].max(tile.bounds[3]);
        }

        Self {
            output: output.into(),
            crs: crs.into(),
            resolution,
            bounds,
            dtype: dtype.into(),
            tiles,
        }
    }
}
