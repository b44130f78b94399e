//! Spatio-temporal extents: the geometry and time range a run covers.
//!
//! Geometries are declared in an arbitrary CRS and transformed into the run's
//! grid CRS before partitioning. Polygon arithmetic here is deliberately
//! minimal: bounding boxes, point-in-ring tests and rectangle clipping are all
//! the partitioner needs.

use crate::crs::{self, Bounds, ProjCache};
use crate::error::ValidationError;
use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A 2D point as [x, y] in the geometry's CRS.
pub type Coord = [f64; 2];

/// Area-of-interest geometry.
///
/// Rings are closed implicitly (the last vertex connects back to the first).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    /// Axis-aligned bounding box [min_x, min_y, max_x, max_y].
    Bbox { bounds: Bounds },

    /// Single polygon given as its outer ring.
    Polygon { ring: Vec<Coord> },

    /// Multiple polygons, each given as its outer ring.
    MultiPolygon { rings: Vec<Vec<Coord>> },

    /// Single point.
    Point { coord: Coord },

    /// Multiple points.
    MultiPoint { coords: Vec<Coord> },
}

impl Geometry {
    /// Enclosing bounding box of the geometry.
    pub fn bounds(&self) -> Bounds {
        match self {
            Geometry::Bbox { bounds } => *bounds,
            Geometry::Polygon { ring } => coords_bounds(ring),
            Geometry::MultiPolygon { rings } => {
                let mut b = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
                for ring in rings {
                    let rb = coords_bounds(ring);
                    b = union_bounds(&b, &rb);
                }
                b
            }
            Geometry::Point { coord } => [coord[0], coord[1], coord[0], coord[1]],
            Geometry::MultiPoint { coords } => coords_bounds(coords),
        }
    }

    /// Whether the geometry has zero area (points only).
    pub fn is_pointlike(&self) -> bool {
        matches!(self, Geometry::Point { .. } | Geometry::MultiPoint { .. })
    }

    /// All point coordinates for point-like geometries.
    pub fn points(&self) -> Vec<Coord> {
        match self {
            Geometry::Point { coord } => vec![*coord],
            Geometry::MultiPoint { coords } => coords.clone(),
            _ => Vec::new(),
        }
    }

    /// Area of the geometry's intersection with an axis-aligned rectangle.
    ///
    /// Used by the partitioner's sparse-coverage test: a grid cell is kept
    /// only if enough of the AOI falls inside it.
    pub fn intersection_area(&self, rect: &Bounds) -> f64 {
        match self {
            Geometry::Bbox { bounds } => crs::intersect_bounds(bounds, rect)
                .map(|b| crs::bounds_area(&b))
                .unwrap_or(0.0),
            Geometry::Polygon { ring } => clipped_ring_area(ring, rect),
            Geometry::MultiPolygon { rings } => {
                rings.iter().map(|r| clipped_ring_area(r, rect)).sum()
            }
            // Points carry no area; the partitioner buffers them first.
            Geometry::Point { .. } | Geometry::MultiPoint { .. } => 0.0,
        }
    }

    /// Transform all coordinates into another CRS.
    pub fn transform(&self, from_crs: &str, to_crs: &str, cache: &ProjCache) -> Result<Geometry> {
        let tp = |c: &Coord| -> Result<Coord> {
            let (x, y) = crs::transform_point(c[0], c[1], from_crs, to_crs, cache)?;
            Ok([x, y])
        };
        Ok(match self {
            Geometry::Bbox { bounds } => Geometry::Bbox {
                bounds: crs::transform_bounds(bounds, from_crs, to_crs, cache)?,
            },
            Geometry::Polygon { ring } => Geometry::Polygon {
                ring: ring.iter().map(tp).collect::<Result<_>>()?,
            },
            Geometry::MultiPolygon { rings } => Geometry::MultiPolygon {
                rings: rings
                    .iter()
                    .map(|r| r.iter().map(tp).collect::<Result<_>>())
                    .collect::<Result<_>>()?,
            },
            Geometry::Point { coord } => Geometry::Point { coord: tp(coord)? },
            Geometry::MultiPoint { coords } => Geometry::MultiPoint {
                coords: coords.iter().map(tp).collect::<Result<_>>()?,
            },
        })
    }
}

/// Spatial extent: a geometry plus the CRS its coordinates are expressed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialExtent {
    pub geometry: Geometry,

    /// CRS of the geometry coordinates (e.g. "EPSG:4326").
    #[serde(default = "default_extent_crs")]
    pub crs: String,
}

fn default_extent_crs() -> String {
    "EPSG:4326".to_string()
}

impl SpatialExtent {
    /// Reproject the extent into the given CRS.
    pub fn to_crs(&self, crs: &str, cache: &ProjCache) -> Result<SpatialExtent> {
        Ok(SpatialExtent {
            geometry: self.geometry.transform(&self.crs, crs, cache)?,
            crs: crs.to_string(),
        })
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::Extent(format!(
                "time range start {} is not before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Compact identifier used in tile ids and artifact names: YYYYMMDD-YYYYMMDD.
    pub fn key(&self) -> String {
        format!(
            "{}-{}",
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d")
        )
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The full extent of a run. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatioTemporalExtent {
    pub space: SpatialExtent,
    pub time: TimeRange,
}

fn coords_bounds(coords: &[Coord]) -> Bounds {
    let mut b = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    for c in coords {
        b[0] = b[0].min(c[0]);
        b[1] = b[1].min(c[1]);
        b[2] = b[2].max(c[0]);
        b[3] = b[3].max(c[1]);
    }
    b
}

fn union_bounds(a: &Bounds, b: &Bounds) -> Bounds {
    [
        a[0].min(b[0]),
        a[1].min(b[1]),
        a[2].max(b[2]),
        a[3].max(b[3]),
    ]
}

/// Signed shoelace area of a ring, returned as absolute value.
fn ring_area(ring: &[Coord]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        sum += a[0] * b[1] - b[0] * a[1];
    }
    (sum / 2.0).abs()
}

/// Area of a ring clipped to an axis-aligned rectangle (Sutherland–Hodgman).
fn clipped_ring_area(ring: &[Coord], rect: &Bounds) -> f64 {
    let clipped = clip_ring_to_rect(ring, rect);
    ring_area(&clipped)
}

/// Clip a ring against the four half-planes of a rectangle.
fn clip_ring_to_rect(ring: &[Coord], rect: &Bounds) -> Vec<Coord> {
    let mut out = ring.to_vec();
    out = clip_halfplane(&out, |p| p[0] >= rect[0], |a, b| intersect_vertical(a, b, rect[0]));
    out = clip_halfplane(&out, |p| p[0] <= rect[2], |a, b| intersect_vertical(a, b, rect[2]));
    out = clip_halfplane(&out, |p| p[1] >= rect[1], |a, b| intersect_horizontal(a, b, rect[1]));
    out = clip_halfplane(&out, |p| p[1] <= rect[3], |a, b| intersect_horizontal(a, b, rect[3]));
    out
}

fn clip_halfplane(
    ring: &[Coord],
    inside: impl Fn(&Coord) -> bool,
    intersect: impl Fn(&Coord, &Coord) -> Coord,
) -> Vec<Coord> {
    let mut out = Vec::with_capacity(ring.len() + 2);
    for i in 0..ring.len() {
        let current = ring[i];
        let prev = ring[(i + ring.len() - 1) % ring.len()];
        let cur_in = inside(&current);
        let prev_in = inside(&prev);
        if cur_in {
            if !prev_in {
                out.push(intersect(&prev, &current));
            }
            out.push(current);
        } else if prev_in {
            out.push(intersect(&prev, &current));
        }
    }
    out
}

fn intersect_vertical(a: &Coord, b: &Coord, x: f64) -> Coord {
    let t = (x - a[0]) / (b[0] - a[0]);
    [x, a[1] + t * (b[1] - a[1])]
}

fn intersect_horizontal(a: &Coord, b: &Coord, y: f64) -> Coord {
    let t = (y - a[1]) / (b[1] - a[1]);
    [a[0] + t * (b[0] - a[0]), y]
}
