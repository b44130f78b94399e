//! Extent partitioning: split a spatio-temporal extent into disjoint tiles.
//!
//! Spatial and temporal chunking compose as a product, except along axes the
//! recipe operates over (those are kept whole, see [`crate::recipe::tile_dims`]).

mod grid;
mod temporal;

pub use grid::SpatialCell;
pub use temporal::chunk_time_range;

use crate::crs::{Bounds, ProjCache};
use crate::error::ValidationError;
use crate::extent::{SpatioTemporalExtent, TimeRange};
use crate::recipe::TileDims;
use serde::{Deserialize, Serialize};

/// How large tiles are and how the extent is cut into them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilePolicy {
    /// Tile edge length in pixels.
    #[serde(default = "default_tile_size")]
    pub tile_size: usize,

    /// Overlap margin in pixels applied to every grid cell edge. The only
    /// sanctioned source of overlapping tiles.
    #[serde(default)]
    pub margin: usize,

    /// Pixel neighbourhood around point AOIs (edge length of a point tile).
    #[serde(default = "default_point_neighborhood")]
    pub point_neighborhood: usize,

    /// Points closer than this many pixels share one tile.
    #[serde(default = "default_point_cluster_distance")]
    pub point_cluster_distance: f64,

    /// Calendar chunking of the time range.
    #[serde(default)]
    pub temporal_chunk: TemporalChunk,
}

impl Default for TilePolicy {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            margin: 0,
            point_neighborhood: default_point_neighborhood(),
            point_cluster_distance: default_point_cluster_distance(),
            temporal_chunk: TemporalChunk::default(),
        }
    }
}

fn default_tile_size() -> usize {
    1024
}

fn default_point_neighborhood() -> usize {
    32
}

fn default_point_cluster_distance() -> f64 {
    64.0
}

/// Calendar unit the time range is chunked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemporalChunk {
    /// Keep the full time range in every tile.
    #[default]
    Whole,
    Year,
    Month,
}

/// One disjoint spatio-temporal unit of work.
///
/// Owned by the partitioner run that created it; downstream components only
/// ever borrow it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    /// Deterministic identity derived from the tile's bounds, never from
    /// enumeration order.
    pub tile_id: String,

    /// Dispatch bounds in the grid CRS, including the margin.
    pub bounds: Bounds,

    /// Cell bounds without the margin.
    pub core_bounds: Bounds,

    /// Temporal sub-range (the full run range unless temporally chunked).
    pub time: TimeRange,
}

impl Tile {
    /// Rank used for deterministic overlap resolution: lexicographic by id,
    /// so the result is independent of completion order.
    pub fn rank_key(&self) -> &str {
        &self.tile_id
    }
}

/// Split an extent into tiles.
///
/// The geometry is first transformed into the grid CRS. Grid cells that do
/// not meaningfully intersect the AOI (less than half a pixel of area) are
/// discarded; point AOIs produce one tile per proximity cluster instead of a
/// grid. Fails when no tile survives.
pub fn partition(
    extent: &SpatioTemporalExtent,
    policy: &TilePolicy,
    resolution: f64,
    grid_crs: &str,
    dims: TileDims,
    cache: &ProjCache,
) -> Result<Vec<Tile>, ValidationError> {
    if resolution <= 0.0 {
        return Err(ValidationError::Config(format!(
            "resolution must be positive, got {}",
            resolution
        )));
    }

    let space = extent
        .space
        .to_crs(grid_crs, cache)
        .map_err(|e| ValidationError::Extent(format!("{:#}", e)))?;

    let cells = grid::spatial_cells(&space.geometry, resolution, policy, dims.space);
    if cells.is_empty() {
        return Err(ValidationError::EmptyTileSet);
    }

    if !dims.space {
        tracing::debug!("spatial chunking suppressed: recipe operates over space");
    }

    let time_chunks = if dims.time {
        temporal::chunk_time_range(&extent.time, policy.temporal_chunk)
    } else {
        if policy.temporal_chunk != TemporalChunk::Whole {
            tracing::warn!(
                "temporal chunking suppressed: recipe operates over time, \
                 tiles keep the full range {}",
                extent.time
            );
        }
        vec![extent.time]
    };

    let mut tiles = Vec::with_capacity(cells.len() * time_chunks.len());
    for cell in &cells {
        for time in &time_chunks {
            tiles.push(Tile {
                tile_id: format!("{}_{}", cell.id_key(resolution), time.key()),
                bounds: cell.bounds,
                core_bounds: cell.core_bounds,
                time: *time,
            });
        }
    }

    tracing::info!(
        "Partitioned extent into {} tiles ({} spatial cells x {} time chunks)",
        tiles.len(),
        cells.len(),
        time_chunks.len()
    );

    Ok(tiles)
}
