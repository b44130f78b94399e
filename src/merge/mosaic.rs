//! Mosaic canvas: accumulates tile layers into one raster per band.
//!
//! NaN is the nodata value throughout. Overlapping pixels (from the
//! partitioner's margin) are resolved by the configured policy; last-writer
//! ranking uses a fixed per-tile rank so the outcome never depends on
//! completion order.

use super::layer::{BandKind, TileLayer};
use super::OverlapPolicy;
use crate::crs::Bounds;
use ndarray::{Array2, Array3};

/// Per-band accumulation plane.
struct Plane {
    /// Running value: winner so far for last-wins, running sum for average.
    value: Array2<f64>,

    /// Contributions per pixel (average policy).
    count: Array2<u32>,

    /// Writer rank + 1 per pixel, 0 for untouched (last-wins policy).
    rank: Array2<u32>,
}

impl Plane {
    fn new(height: usize, width: usize) -> Self {
        Self {
            value: Array2::from_elem((height, width), f64::NAN),
            count: Array2::zeros((height, width)),
            rank: Array2::zeros((height, width)),
        }
    }
}

/// Accumulator for one output's mosaic over the run's bounding box.
///
/// Band labels are unioned across tiles as they stream in; a band a tile does
/// not carry stays NaN in that tile's footprint.
pub struct MosaicCanvas {
    policy: OverlapPolicy,
    bounds: Bounds,
    resolution: f64,
    height: usize,
    width: usize,
    kind: BandKind,
    bands: Vec<String>,
    planes: Vec<Plane>,
}

impl MosaicCanvas {
    /// Create an empty canvas covering `bounds` at `resolution`.
    pub fn new(bounds: Bounds, resolution: f64, policy: OverlapPolicy) -> Self {
        let width = (((bounds[2] - bounds[0]) / resolution).ceil() as usize).max(1);
        let height = (((bounds[3] - bounds[1]) / resolution).ceil() as usize).max(1);
        Self {
            policy,
            bounds,
            resolution,
            height,
            width,
            kind: BandKind::None,
            bands: Vec::new(),
            planes: Vec::new(),
        }
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.planes.len().max(1), self.height, self.width)
    }

    /// Place one tile layer onto the canvas.
    ///
    /// `rank` is the tile's position in the fixed overlap ordering. Pixels
    /// falling outside the canvas (margins at the run edge) are dropped.
    pub fn place(&mut self, layer: &TileLayer, rank: u32) -> Result<(), String> {
        if (layer.resolution - self.resolution).abs() > f64::EPSILON {
            return Err(format!(
                "resolution mismatch: canvas {} vs tile {}",
                self.resolution, layer.resolution
            ));
        }
        if self.planes.is_empty() {
            self.kind = layer.kind;
        } else if self.kind != layer.kind && layer.kind != BandKind::None {
            return Err(format!(
                "band axis mismatch: canvas '{}' vs tile '{}'",
                self.kind.as_str(),
                layer.kind.as_str()
            ));
        }

        // Top-down placement: canvas row 0 is at max_y
        let col0 = ((layer.bounds[0] - self.bounds[0]) / self.resolution).round() as i64;
        let row0 = ((self.bounds[3] - layer.bounds[3]) / self.resolution).round() as i64;

        let band_indices: Vec<usize> = if layer.bands.is_empty() {
            vec![self.ensure_band("")]
        } else {
            layer.bands.iter().map(|b| self.ensure_band(b)).collect()
        };

        let (n_bands, tile_h, tile_w) = layer.data.dim();
        debug_assert_eq!(n_bands, band_indices.len());

        for (src_band, &dst_band) in band_indices.iter().enumerate() {
            let plane = &mut self.planes[dst_band];
            for r in 0..tile_h {
                let row = row0 + r as i64;
                if row < 0 || row >= self.height as i64 {
                    continue;
                }
                for c in 0..tile_w {
                    let col = col0 + c as i64;
                    if col < 0 || col >= self.width as i64 {
                        continue;
                    }
                    let v = layer.data[[src_band, r, c]];
                    if v.is_nan() {
                        continue;
                    }
                    let idx = [row as usize, col as usize];
                    match self.policy {
                        OverlapPolicy::LastWins => {
                            if rank + 1 >= plane.rank[idx] {
                                plane.value[idx] = v;
                                plane.rank[idx] = rank + 1;
                            }
                        }
                        OverlapPolicy::Average => {
                            if plane.count[idx] == 0 {
                                plane.value[idx] = v;
                            } else {
                                plane.value[idx] += v;
                            }
                            plane.count[idx] += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn ensure_band(&mut self, label: &str) -> usize {
        if let Some(idx) = self.bands.iter().position(|b| b == label) {
            return idx;
        }
        self.bands.push(label.to_string());
        self.planes.push(Plane::new(self.height, self.width));
        self.planes.len() - 1
    }

    /// Finish accumulation: bands are sorted for a deterministic axis order
    /// and averages are resolved.
    pub fn finalize(mut self) -> (Vec<String>, BandKind, Array3<f64>) {
        let mut order: Vec<usize> = (0..self.bands.len()).collect();
        order.sort_by(|&a, &b| self.bands[a].cmp(&self.bands[b]));

        let n = self.planes.len().max(1);
        let mut data = Array3::from_elem((n, self.height, self.width), f64::NAN);
        let mut labels = Vec::with_capacity(self.bands.len());

        for (dst, &src) in order.iter().enumerate() {
            labels.push(self.bands[src].clone());
            let plane = &mut self.planes[src];
            if self.policy == OverlapPolicy::Average {
                for r in 0..self.height {
                    for c in 0..self.width {
                        let count = plane.count[[r, c]];
                        if count > 0 {
                            plane.value[[r, c]] /= count as f64;
                        }
                    }
                }
            }
            data.index_axis_mut(ndarray::Axis(0), dst)
                .assign(&plane.value);
        }

        // The placeholder label of band-less layers does not surface
        if labels.len() == 1 && labels[0].is_empty() {
            labels.clear();
        }

        (labels, self.kind, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DataType;
    use ndarray::Array3 as A3;

    fn layer(bounds: Bounds, bands: Vec<&str>, kind: BandKind, fill: f64) -> TileLayer {
        let h = (bounds[3] - bounds[1]) as usize;
        let w = (bounds[2] - bounds[0]) as usize;
        TileLayer {
            bands: bands.iter().map(|s| s.to_string()).collect(),
            kind,
            data: A3::from_elem((bands.len().max(1), h, w), fill),
            bounds,
            resolution: 1.0,
            crs: "EPSG:3857".to_string(),
            dtype: DataType::Float64,
        }
    }

    #[test]
    fn test_single_tile_mosaic() {
        let mut canvas = MosaicCanvas::new([0.0, 0.0, 4.0, 4.0], 1.0, OverlapPolicy::LastWins);
        canvas
            .place(&layer([0.0, 0.0, 4.0, 4.0], vec![], BandKind::None, 7.0), 0)
            .unwrap();
        let (labels, _, data) = canvas.finalize();
        assert!(labels.is_empty());
        assert_eq!(data.dim(), (1, 4, 4));
        assert_eq!(data[[0, 0, 0]], 7.0);
        assert_eq!(data[[0, 3, 3]], 7.0);
    }

    #[test]
    fn test_two_tiles_fill_disjoint_halves() {
        let mut canvas = MosaicCanvas::new([0.0, 0.0, 4.0, 2.0], 1.0, OverlapPolicy::LastWins);
        canvas
            .place(&layer([0.0, 0.0, 2.0, 2.0], vec![], BandKind::None, 1.0), 0)
            .unwrap();
        canvas
            .place(&layer([2.0, 0.0, 4.0, 2.0], vec![], BandKind::None, 2.0), 1)
            .unwrap();
        let (_, _, data) = canvas.finalize();
        assert_eq!(data[[0, 0, 0]], 1.0);
        assert_eq!(data[[0, 0, 3]], 2.0);
    }

    #[test]
    fn test_overlap_last_wins_is_rank_ordered() {
        let mut canvas = MosaicCanvas::new([0.0, 0.0, 2.0, 2.0], 1.0, OverlapPolicy::LastWins);
        // Higher-rank tile placed first: arrival order must not matter
        canvas
            .place(&layer([0.0, 0.0, 2.0, 2.0], vec![], BandKind::None, 9.0), 5)
            .unwrap();
        canvas
            .place(&layer([0.0, 0.0, 2.0, 2.0], vec![], BandKind::None, 1.0), 2)
            .unwrap();
        let (_, _, data) = canvas.finalize();
        assert_eq!(data[[0, 0, 0]], 9.0);
    }

    #[test]
    fn test_overlap_average() {
        let mut canvas = MosaicCanvas::new([0.0, 0.0, 2.0, 2.0], 1.0, OverlapPolicy::Average);
        canvas
            .place(&layer([0.0, 0.0, 2.0, 2.0], vec![], BandKind::None, 10.0), 0)
            .unwrap();
        canvas
            .place(&layer([0.0, 0.0, 2.0, 2.0], vec![], BandKind::None, 20.0), 1)
            .unwrap();
        let (_, _, data) = canvas.finalize();
        assert_eq!(data[[0, 1, 1]], 15.0);
    }

    #[test]
    fn test_band_union_with_nan_fill() {
        let mut canvas = MosaicCanvas::new([0.0, 0.0, 4.0, 2.0], 1.0, OverlapPolicy::LastWins);
        canvas
            .place(
                &layer([0.0, 0.0, 2.0, 2.0], vec!["a", "b"], BandKind::Group, 1.0),
                0,
            )
            .unwrap();
        canvas
            .place(
                &layer([2.0, 0.0, 4.0, 2.0], vec!["b", "c"], BandKind::Group, 2.0),
                1,
            )
            .unwrap();
        let (labels, kind, data) = canvas.finalize();
        assert_eq!(labels, vec!["a", "b", "c"]);
        assert_eq!(kind, BandKind::Group);
        assert_eq!(data.dim(), (3, 2, 4));
        // Band "a" exists only in the left tile
        assert_eq!(data[[0, 0, 0]], 1.0);
        assert!(data[[0, 0, 3]].is_nan());
        // Band "b" exists in both
        assert_eq!(data[[1, 0, 0]], 1.0);
        assert_eq!(data[[1, 0, 3]], 2.0);
        // Band "c" exists only in the right tile
        assert!(data[[2, 0, 0]].is_nan());
        assert_eq!(data[[2, 0, 3]], 2.0);
    }

    #[test]
    fn test_margin_pixels_outside_canvas_dropped() {
        let mut canvas = MosaicCanvas::new([0.0, 0.0, 2.0, 2.0], 1.0, OverlapPolicy::LastWins);
        // Tile extends one pixel beyond the canvas on every side
        canvas
            .place(&layer([-1.0, -1.0, 3.0, 3.0], vec![], BandKind::None, 4.0), 0)
            .unwrap();
        let (_, _, data) = canvas.finalize();
        assert_eq!(data.dim(), (1, 2, 2));
        assert_eq!(data[[0, 0, 0]], 4.0);
    }

    #[test]
    fn test_resolution_mismatch_rejected() {
        let mut canvas = MosaicCanvas::new([0.0, 0.0, 2.0, 2.0], 1.0, OverlapPolicy::LastWins);
        let mut bad = layer([0.0, 0.0, 2.0, 2.0], vec![], BandKind::None, 1.0);
        bad.resolution = 2.0;
        assert!(canvas.place(&bad, 0).is_err());
    }

    #[test]
    fn test_band_sort_is_deterministic() {
        let mut canvas = MosaicCanvas::new([0.0, 0.0, 1.0, 1.0], 1.0, OverlapPolicy::LastWins);
        canvas
            .place(
                &layer([0.0, 0.0, 1.0, 1.0], vec!["z", "a"], BandKind::Time, 1.0),
                0,
            )
            .unwrap();
        let (labels, _, _) = canvas.finalize();
        assert_eq!(labels, vec!["a", "z"]);
    }
}
