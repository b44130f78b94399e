//! Coordinate Reference System utilities.
//!
//! All tiles of one run share a single grid CRS; the only transformations the
//! core performs are from the extent's declared CRS into that grid CRS before
//! partitioning. Bounds arrays follow the `[min_x, min_y, max_x, max_y]`
//! convention throughout.

use anyhow::{Context, Result};
use proj::Proj;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Bounds in a specific CRS: [min_x, min_y, max_x, max_y]
pub type Bounds = [f64; 4];

/// Thread-safe cache for Proj transformations.
///
/// Creating Proj objects is expensive, so they are cached by
/// (source, target) CRS pair.
#[derive(Default)]
pub struct ProjCache {
    cache: RwLock<HashMap<(String, String), Arc<Proj>>>,
}

impl ProjCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a Proj transformation between two CRS.
    pub fn get(&self, from_crs: &str, to_crs: &str) -> Result<Arc<Proj>> {
        let key = (from_crs.to_string(), to_crs.to_string());

        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(proj) = cache.get(&key) {
                return Ok(proj.clone());
            }
        }

        let proj = Proj::new_known_crs(from_crs, to_crs, None)
            .with_context(|| format!("Failed to create projection from {} to {}", from_crs, to_crs))?;

        let proj = Arc::new(proj);

        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert(key, proj.clone());
        }

        Ok(proj)
    }
}

/// Transform a single point between CRS.
pub fn transform_point(
    x: f64,
    y: f64,
    from_crs: &str,
    to_crs: &str,
    cache: &ProjCache,
) -> Result<(f64, f64)> {
    if from_crs == to_crs {
        return Ok((x, y));
    }

    let proj = cache.get(from_crs, to_crs)?;
    proj.convert((x, y))
        .with_context(|| format!("Failed to transform point ({}, {}) from {} to {}", x, y, from_crs, to_crs))
}

/// Transform bounds between CRS.
///
/// Transforms all 4 corners and returns the bounding box of the result,
/// which absorbs projection distortion.
pub fn transform_bounds(
    bounds: &Bounds,
    from_crs: &str,
    to_crs: &str,
    cache: &ProjCache,
) -> Result<Bounds> {
    if from_crs == to_crs {
        return Ok(*bounds);
    }

    let proj = cache.get(from_crs, to_crs)?;

    let corners = [
        (bounds[0], bounds[1]),
        (bounds[2], bounds[1]),
        (bounds[2], bounds[3]),
        (bounds[0], bounds[3]),
    ];

    let mut min_x = f64::MAX;
    let mut min_y = f64::MAX;
    let mut max_x = f64::MIN;
    let mut max_y = f64::MIN;

    for (x, y) in corners {
        let (tx, ty) = proj
            .convert((x, y))
            .with_context(|| format!("Failed to transform corner ({}, {})", x, y))?;
        min_x = min_x.min(tx);
        min_y = min_y.min(ty);
        max_x = max_x.max(tx);
        max_y = max_y.max(ty);
    }

    Ok([min_x, min_y, max_x, max_y])
}

/// Compute the intersection of two bounds.
///
/// Returns None if there is no intersection.
pub fn intersect_bounds(a: &Bounds, b: &Bounds) -> Option<Bounds> {
    let min_x = a[0].max(b[0]);
    let min_y = a[1].max(b[1]);
    let max_x = a[2].min(b[2]);
    let max_y = a[3].min(b[3]);

    if min_x < max_x && min_y < max_y {
        Some([min_x, min_y, max_x, max_y])
    } else {
        None
    }
}

/// Area of a bounds rectangle, zero for degenerate bounds.
pub fn bounds_area(b: &Bounds) -> f64 {
    ((b[2] - b[0]) * (b[3] - b[1])).max(0.0)
}
