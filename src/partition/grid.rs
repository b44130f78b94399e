//! Spatial gridding of an AOI geometry.

use super::TilePolicy;
use crate::crs::Bounds;
use crate::extent::Geometry;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

/// One spatial grid cell (or point-neighbourhood cell) of the partition.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialCell {
    /// Cell bounds without the margin.
    pub core_bounds: Bounds,

    /// Cell bounds expanded by the margin.
    pub bounds: Bounds,

    /// Point-neighbourhood cells get a distinct id prefix.
    point: bool,
}

impl SpatialCell {
    /// Identity component derived purely from the cell's min corner,
    /// quantised to the grid resolution.
    pub fn id_key(&self, resolution: f64) -> String {
        let qx = (self.core_bounds[0] / resolution).round() as i64;
        let qy = (self.core_bounds[1] / resolution).round() as i64;
        if self.point {
            format!("px{}_y{}", qx, qy)
        } else {
            format!("x{}_y{}", qx, qy)
        }
    }
}

/// Lay out the spatial cells for a geometry already in the grid CRS.
///
/// Point-like geometries get one cell per proximity cluster; everything else
/// gets a regular grid over the enclosing bounding box with cells that miss
/// the actual geometry discarded (sparse coverage). When spatial chunking is
/// suppressed a single cell covers the whole bounding box.
pub fn spatial_cells(
    geometry: &Geometry,
    resolution: f64,
    policy: &TilePolicy,
    space_allowed: bool,
) -> Vec<SpatialCell> {
    if geometry.is_pointlike() {
        return point_cells(geometry, resolution, policy);
    }

    let bbox = geometry.bounds();
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width <= 0.0 || height <= 0.0 {
        return Vec::new();
    }

    if !space_allowed {
        return vec![SpatialCell {
            core_bounds: bbox,
            bounds: bbox,
            point: false,
        }];
    }

    let cell_size = policy.tile_size as f64 * resolution;
    let margin = policy.margin as f64 * resolution;
    let nx = (width / cell_size).ceil() as usize;
    let ny = (height / cell_size).ceil() as usize;

    // A cell is kept only if the AOI covers at least half a pixel of it,
    // so sliver intersections do not allocate compute.
    let coverage_threshold = 0.5 * resolution * resolution;

    let mut cells = Vec::new();
    for iy in 0..ny {
        for ix in 0..nx {
            let core = [
                bbox[0] + ix as f64 * cell_size,
                bbox[1] + iy as f64 * cell_size,
                bbox[0] + (ix + 1) as f64 * cell_size,
                bbox[1] + (iy + 1) as f64 * cell_size,
            ];
            if geometry.intersection_area(&core) < coverage_threshold {
                continue;
            }
            cells.push(SpatialCell {
                core_bounds: core,
                bounds: [
                    core[0] - margin,
                    core[1] - margin,
                    core[2] + margin,
                    core[3] + margin,
                ],
                point: false,
            });
        }
    }
    cells
}

struct IndexedPoint {
    coord: [f64; 2],
    idx: usize,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.coord)
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.coord[0] - point[0];
        let dy = self.coord[1] - point[1];
        dx * dx + dy * dy
    }
}

/// One cell per proximity cluster of points, sized to the configured pixel
/// neighbourhood around the cluster centroid.
fn point_cells(geometry: &Geometry, resolution: f64, policy: &TilePolicy) -> Vec<SpatialCell> {
    let mut points = geometry.points();
    if points.is_empty() {
        return Vec::new();
    }

    // Deterministic cluster seeds regardless of input order
    points.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let tree = RTree::bulk_load(
        points
            .iter()
            .enumerate()
            .map(|(idx, &coord)| IndexedPoint { coord, idx })
            .collect(),
    );

    let cluster_dist = policy.point_cluster_distance * resolution;
    let half_extent = policy.point_neighborhood as f64 * resolution / 2.0;

    let mut visited = vec![false; points.len()];
    let mut cells = Vec::new();

    for (idx, seed) in points.iter().enumerate() {
        if visited[idx] {
            continue;
        }
        let members: Vec<usize> = tree
            .locate_within_distance(*seed, cluster_dist * cluster_dist)
            .filter(|p| !visited[p.idx])
            .map(|p| p.idx)
            .collect();

        let mut cx = 0.0;
        let mut cy = 0.0;
        for &m in &members {
            visited[m] = true;
            cx += points[m][0];
            cy += points[m][1];
        }
        cx /= members.len() as f64;
        cy /= members.len() as f64;

        let bounds = [
            cx - half_extent,
            cy - half_extent,
            cx + half_extent,
            cy + half_extent,
        ];
        cells.push(SpatialCell {
            core_bounds: bounds,
            bounds,
            point: true,
        });
    }
    cells
}
