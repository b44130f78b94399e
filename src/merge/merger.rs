//! Streaming per-output merge.
//!
//! The merger consumes tile results as the scheduler completes them, so only
//! the mosaic canvases (not the raw per-tile arrays) stay resident. Each
//! output is merged independently under its own spec; a failure merging one
//! output never blocks the others.

use super::layer::{normalize, BandKind, TileLayer};
use super::mosaic::MosaicCanvas;
use super::vrt::{VrtIndex, VrtTile};
use super::{MergeMode, MergeSpec, OverlapPolicy};
use crate::crs::Bounds;
use crate::error::MergeError;
use crate::executor::DataType;
use crate::metrics::Metrics;
use crate::partition::Tile;
use crate::scheduler::CompletedTile;
use crate::write::{OutputWriter, RasterArtifact};
use ndarray::Array3;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// The run's target grid: the extent's bounding box in the grid CRS.
#[derive(Debug, Clone)]
pub struct OutputGridSpec {
    pub bounds: Bounds,
    pub resolution: f64,
    pub crs: String,
}

/// One fully merged output, kept in memory for the caller.
#[derive(Debug)]
pub struct MergedOutput {
    pub output: String,
    pub bands: Vec<String>,
    pub kind: BandKind,
    pub data: Array3<f64>,
    pub bounds: Bounds,
    pub resolution: f64,
    pub crs: String,
    pub dtype: DataType,
}

/// Everything the merge stage produced.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Paths of all persisted artifacts.
    pub artifacts: Vec<PathBuf>,

    /// Merged outputs (merge mode only), by output name.
    pub merged: BTreeMap<String, MergedOutput>,

    /// Outputs that failed to merge, with the scoped error.
    pub errors: BTreeMap<String, MergeError>,
}

/// First-seen metadata per output, used for compatibility checks.
#[derive(Debug, Clone)]
struct LayerMeta {
    dtype: DataType,
    crs: String,
    resolution: f64,
}

impl LayerMeta {
    fn of(layer: &TileLayer) -> Self {
        Self {
            dtype: layer.dtype,
            crs: layer.crs.clone(),
            resolution: layer.resolution,
        }
    }

    fn check(&self, layer: &TileLayer) -> Result<(), String> {
        if layer.dtype != self.dtype {
            return Err(format!(
                "dtype mismatch across tiles: {} vs {}",
                self.dtype, layer.dtype
            ));
        }
        if layer.crs != self.crs {
            return Err(format!(
                "CRS mismatch across tiles: {} vs {}",
                self.crs, layer.crs
            ));
        }
        if (layer.resolution - self.resolution).abs() > f64::EPSILON {
            return Err(format!(
                "resolution mismatch across tiles: {} vs {}",
                self.resolution, layer.resolution
            ));
        }
        Ok(())
    }
}

enum OutputState {
    Merge {
        canvas: MosaicCanvas,
        meta: Option<LayerMeta>,
        tiles_seen: usize,
    },
    Vrt {
        entries: Vec<VrtTile>,
        meta: Option<LayerMeta>,
    },
    KeepTiles,
}

/// Streaming merger for one run.
pub struct ResultMerger {
    grid: OutputGridSpec,
    writer: Option<Arc<OutputWriter>>,
    states: BTreeMap<String, OutputState>,
    errors: BTreeMap<String, MergeError>,
    artifacts: Vec<PathBuf>,

    /// Fixed overlap ranking: position of the tile id in lexicographic order.
    ranks: HashMap<String, u32>,
    metrics: Arc<Metrics>,
}

impl ResultMerger {
    /// Set up per-output state for the given specs and tile set.
    ///
    /// `writer` must be present when any output uses `vrt` or `none` mode
    /// (enforced by run validation before dispatch).
    pub fn new(
        specs: &BTreeMap<String, MergeSpec>,
        grid: OutputGridSpec,
        tiles: &[Tile],
        writer: Option<Arc<OutputWriter>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut ids: Vec<&str> = tiles.iter().map(|t| t.rank_key()).collect();
        ids.sort_unstable();
        let ranks = ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), i as u32))
            .collect();

        let states = specs
            .iter()
            .map(|(name, spec)| {
                let state = match spec.mode {
                    MergeMode::Merge => OutputState::Merge {
                        canvas: MosaicCanvas::new(
                            grid.bounds,
                            grid.resolution,
                            spec.overlap.unwrap_or(OverlapPolicy::LastWins),
                        ),
                        meta: None,
                        tiles_seen: 0,
                    },
                    MergeMode::Vrt => OutputState::Vrt {
                        entries: Vec::new(),
                        meta: None,
                    },
                    MergeMode::None => OutputState::KeepTiles,
                };
                (name.clone(), state)
            })
            .collect();

        Self {
            grid,
            writer,
            states,
            errors: BTreeMap::new(),
            artifacts: Vec::new(),
            ranks,
            metrics,
        }
    }

    /// Fold one completed tile into every output's state.
    pub async fn accept(&mut self, completed: CompletedTile) {
        let tile = &completed.tile;
        let rank = self.ranks.get(&tile.tile_id).copied().unwrap_or(0);

        for (name, array) in &completed.result {
            if self.errors.contains_key(name) {
                continue;
            }
            let Some(state) = self.states.get_mut(name) else {
                continue;
            };

            let layer = match normalize(array) {
                Ok(layer) => layer,
                Err(reason) => {
                    self.fail_output(name.clone(), reason);
                    continue;
                }
            };

            let started = Instant::now();
            let failure: Option<String> = match state {
                OutputState::Merge {
                    canvas,
                    meta,
                    tiles_seen,
                } => {
                    let check = match meta {
                        Some(meta) => meta.check(&layer),
                        None => {
                            *meta = Some(LayerMeta::of(&layer));
                            Ok(())
                        }
                    };
                    match check.and_then(|_| canvas.place(&layer, rank)) {
                        Ok(()) => {
                            *tiles_seen += 1;
                            None
                        }
                        Err(reason) => Some(reason),
                    }
                }
                OutputState::Vrt { entries, meta } => {
                    let check = match meta {
                        Some(meta) => meta.check(&layer),
                        None => {
                            *meta = Some(LayerMeta::of(&layer));
                            Ok(())
                        }
                    };
                    match check {
                        Ok(()) => {
                            match write_tile_artifact(
                                self.writer.as_deref(),
                                name,
                                &tile.tile_id,
                                &layer,
                            )
                            .await
                            {
                                Ok(path) => {
                                    entries.push(VrtTile {
                                        tile_id: tile.tile_id.clone(),
                                        path: OutputWriter::artifact_dir_name(&format!(
                                            "{}__{}",
                                            name, tile.tile_id
                                        )),
                                        bounds: layer.bounds,
                                        width: layer.width(),
                                        height: layer.height(),
                                        bands: layer.bands.clone(),
                                    });
                                    self.artifacts.push(path);
                                    None
                                }
                                Err(reason) => Some(reason),
                            }
                        }
                        Err(reason) => Some(reason),
                    }
                }
                OutputState::KeepTiles => {
                    match write_tile_artifact(self.writer.as_deref(), name, &tile.tile_id, &layer)
                        .await
                    {
                        Ok(path) => {
                            self.artifacts.push(path);
                            None
                        }
                        Err(reason) => Some(reason),
                    }
                }
            };
            self.metrics.add_merge_time(started.elapsed());

            if let Some(reason) = failure {
                self.fail_output(name.clone(), reason);
            }
        }
    }

    fn fail_output(&mut self, name: String, reason: String) {
        tracing::error!("Merging output '{}' failed: {}", name, reason);
        self.states.remove(&name);
        self.errors
            .insert(name.clone(), MergeError::new(name, reason));
    }

    /// Finish all outputs: resolve canvases, write merged artifacts and vrt
    /// indexes.
    pub async fn finalize(mut self) -> MergeReport {
        let mut report = MergeReport {
            artifacts: std::mem::take(&mut self.artifacts),
            ..MergeReport::default()
        };

        for (name, state) in std::mem::take(&mut self.states) {
            match state {
                OutputState::Merge {
                    canvas,
                    meta,
                    tiles_seen,
                } => {
                    if tiles_seen == 0 {
                        tracing::warn!("Output '{}' received no tile results, skipping", name);
                        continue;
                    }
                    let meta = meta.expect("meta recorded with the first placed tile");
                    let started = Instant::now();
                    let (bands, kind, data) = canvas.finalize();
                    self.metrics.add_merge_time(started.elapsed());

                    let merged = MergedOutput {
                        output: name.clone(),
                        bands,
                        kind,
                        data,
                        bounds: self.grid.bounds,
                        resolution: self.grid.resolution,
                        crs: meta.crs.clone(),
                        dtype: meta.dtype,
                    };

                    if let Some(writer) = self.writer.as_deref() {
                        match write_merged_artifacts(writer, &merged).await {
                            Ok(mut paths) => report.artifacts.append(&mut paths),
                            Err(reason) => {
                                report
                                    .errors
                                    .insert(name.clone(), MergeError::new(name.clone(), reason));
                                continue;
                            }
                        }
                    }
                    report.merged.insert(name, merged);
                }
                OutputState::Vrt { entries, meta } => {
                    if entries.is_empty() {
                        tracing::warn!("Output '{}' received no tile results, skipping", name);
                        continue;
                    }
                    let meta = meta.expect("meta recorded with the first indexed tile");
                    let index = VrtIndex::new(
                        name.clone(),
                        meta.crs.clone(),
                        meta.resolution,
                        meta.dtype.to_string(),
                        entries,
                    );
                    let writer = self
                        .writer
                        .as_deref()
                        .expect("vrt outputs require a writer (validated before dispatch)");
                    match writer.write_index(&index) {
                        Ok(path) => report.artifacts.push(path),
                        Err(e) => {
                            report
                                .errors
                                .insert(name.clone(), MergeError::new(name, format!("{:#}", e)));
                        }
                    }
                }
                OutputState::KeepTiles => {}
            }
        }

        report.errors.extend(std::mem::take(&mut self.errors));
        report
    }
}

/// Persist one tile's layer for `vrt`/`none` outputs. The name carries the
/// output and tile identity; group keys live in the band labels.
async fn write_tile_artifact(
    writer: Option<&OutputWriter>,
    output: &str,
    tile_id: &str,
    layer: &TileLayer,
) -> Result<PathBuf, String> {
    let writer = writer.ok_or_else(|| "no output directory configured".to_string())?;
    writer
        .write_raster(&RasterArtifact {
            name: format!("{}__{}", output, tile_id),
            data: &layer.data,
            bands: &layer.bands,
            band_kind: layer.kind.as_str(),
            bounds: layer.bounds,
            resolution: layer.resolution,
            crs: &layer.crs,
            dtype: layer.dtype,
        })
        .await
        .map_err(|e| format!("{:#}", e))
}

/// Persist a merged output: one artifact per group when the band axis is a
/// group axis, a single (possibly multi-band) artifact otherwise.
async fn write_merged_artifacts(
    writer: &OutputWriter,
    merged: &MergedOutput,
) -> Result<Vec<PathBuf>, String> {
    let mut paths = Vec::new();

    if merged.kind == BandKind::Group {
        for (idx, group) in merged.bands.iter().enumerate() {
            let slice = merged
                .data
                .index_axis(ndarray::Axis(0), idx)
                .insert_axis(ndarray::Axis(0))
                .to_owned();
            let path = writer
                .write_raster(&RasterArtifact {
                    name: format!("{}__{}", merged.output, group),
                    data: &slice,
                    bands: std::slice::from_ref(group),
                    band_kind: merged.kind.as_str(),
                    bounds: merged.bounds,
                    resolution: merged.resolution,
                    crs: &merged.crs,
                    dtype: merged.dtype,
                })
                .await
                .map_err(|e| format!("{:#}", e))?;
            paths.push(path);
        }
    } else {
        let path = writer
            .write_raster(&RasterArtifact {
                name: merged.output.clone(),
                data: &merged.data,
                bands: &merged.bands,
                band_kind: merged.kind.as_str(),
                bounds: merged.bounds,
                resolution: merged.resolution,
                crs: &merged.crs,
                dtype: merged.dtype,
            })
            .await
            .map_err(|e| format!("{:#}", e))?;
        paths.push(path);
    }

    Ok(paths)
}
