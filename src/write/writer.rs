//! Idempotent Zarr artifact writing.
//!
//! Every artifact is a Zarr v3 array under the output directory, named purely
//! by its naming context (output name, group key, tile id), so re-running the
//! same recipe over the same extent overwrites instead of duplicating.
//! Geospatial placement travels in the array attributes.

use crate::crs::Bounds;
use crate::executor::DataType;
use crate::merge::VrtIndex;
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use ndarray::Array3;
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use zarrs::array::codec::bytes_to_bytes::zstd::ZstdCodec;
use zarrs::array::ArrayBuilder;
use zarrs::group::GroupBuilder;
use zarrs_object_store::AsyncObjectStore;

/// One raster artifact to persist.
pub struct RasterArtifact<'a> {
    /// Artifact name; becomes a single `<name>.zarr` path segment.
    pub name: String,
    pub data: &'a Array3<f64>,
    pub bands: &'a [String],
    pub band_kind: &'a str,
    pub bounds: Bounds,
    pub resolution: f64,
    pub crs: &'a str,
    pub dtype: DataType,
}

/// Writer for one run's output directory.
pub struct OutputWriter {
    root: PathBuf,
    object_store: Arc<dyn ObjectStore>,
    store: Arc<AsyncObjectStore<Arc<dyn ObjectStore>>>,
    compression_level: i32,
    metrics: Arc<Metrics>,
}

impl OutputWriter {
    /// Open (creating if necessary) the output directory and its root group.
    pub async fn create(
        out_dir: &Path,
        compression_level: i32,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

        let object_store: Arc<dyn ObjectStore> = Arc::new(
            LocalFileSystem::new_with_prefix(out_dir)
                .with_context(|| format!("Failed to open store at {}", out_dir.display()))?,
        );
        let store = Arc::new(AsyncObjectStore::new(object_store.clone()));

        let group = GroupBuilder::new().build(store.clone(), "/")?;
        group.async_store_metadata().await?;

        Ok(Self {
            root: out_dir.to_path_buf(),
            object_store,
            store,
            compression_level,
            metrics,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name a raster artifact is stored under.
    pub fn artifact_dir_name(name: &str) -> String {
        format!("{}.zarr", sanitize(name))
    }

    /// Write one raster artifact, replacing any previous artifact of the same
    /// name.
    pub async fn write_raster(&self, artifact: &RasterArtifact<'_>) -> Result<PathBuf> {
        let started = Instant::now();
        let dir_name = Self::artifact_dir_name(&artifact.name);
        self.remove_existing(&dir_name).await?;

        let (bands, height, width) = artifact.data.dim();
        let shape = vec![bands as u64, height as u64, width as u64];

        let mut builder = ArrayBuilder::new(
            shape.clone(),
            shape, // one chunk per artifact
            "float64",
            f64::NAN,
        );
        builder.dimension_names(Some(vec![
            Some("band".to_string()),
            Some("y".to_string()),
            Some("x".to_string()),
        ]));
        builder.bytes_to_bytes_codecs(vec![Arc::new(ZstdCodec::new(
            self.compression_level,
            false,
        ))]);

        let mut attributes = serde_json::Map::new();
        attributes.insert("crs".to_string(), serde_json::json!(artifact.crs));
        attributes.insert(
            "transform".to_string(),
            serde_json::json!([
                artifact.resolution,
                0.0,
                artifact.bounds[0],
                0.0,
                -artifact.resolution,
                artifact.bounds[3]
            ]),
        );
        attributes.insert("bounds".to_string(), serde_json::json!(artifact.bounds));
        attributes.insert(
            "resolution".to_string(),
            serde_json::json!(artifact.resolution),
        );
        attributes.insert(
            "band_labels".to_string(),
            serde_json::json!(artifact.bands),
        );
        attributes.insert(
            "band_kind".to_string(),
            serde_json::json!(artifact.band_kind),
        );
        attributes.insert(
            "source_dtype".to_string(),
            serde_json::json!(artifact.dtype.to_string()),
        );
        builder.attributes(attributes);

        let array = builder.build(self.store.clone(), &format!("/{}", dir_name))?;
        array.async_store_metadata().await?;

        let elements: Vec<f64> = artifact.data.iter().copied().collect();
        array
            .async_store_chunk(&[0, 0, 0], elements.as_slice())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write artifact '{}': {:?}", artifact.name, e))?;

        self.metrics.add_write_time(started.elapsed());
        self.metrics
            .add_bytes_written((elements.len() * std::mem::size_of::<f64>()) as u64);

        Ok(self.root.join(dir_name))
    }

    /// Write one output's vrt index document.
    pub fn write_index(&self, index: &VrtIndex) -> Result<PathBuf> {
        let path = self
            .root
            .join(format!("{}.vrt.json", sanitize(&index.output)));
        let json = serde_json::to_string_pretty(index)?;
        self.metrics.add_bytes_written(json.len() as u64);
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write index {}", path.display()))?;
        Ok(path)
    }

    /// Delete a previous artifact of the same name, if present.
    async fn remove_existing(&self, dir_name: &str) -> Result<()> {
        let prefix = object_store::path::Path::from(dir_name);
        let existing: Vec<_> = self
            .object_store
            .list(Some(&prefix))
            .collect::<Vec<_>>()
            .await;

        if existing.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            "Replacing artifact {}: deleting {} objects",
            dir_name,
            existing.len()
        );

        let store = &self.object_store;
        let _: Vec<_> = stream::iter(existing)
            .filter_map(|meta| async move { meta.ok() })
            .map(|meta| async move {
                if let Err(e) = store.delete(&meta.location).await {
                    tracing::warn!("Failed to delete {:?}: {}", meta.location, e);
                }
            })
            .buffer_unordered(16)
            .collect()
            .await;

        Ok(())
    }
}

/// Restrict artifact names to filesystem-safe characters.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
