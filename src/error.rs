//! Error types for tiled recipe execution.
//!
//! The taxonomy separates failures by blast radius: validation errors abort a
//! run before any tile is dispatched, tile errors are confined to one tile
//! (and retried), merge errors are confined to one output, and I/O errors
//! surface from the final write phase with the manifest left intact.

use thiserror::Error;

/// Errors detected before any work is dispatched. Always fatal for the run.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("recipe parse error at {path}: {message}")]
    Recipe { path: String, message: String },

    #[error("partitioning produced no tiles (degenerate or out-of-bounds extent)")]
    EmptyTileSet,

    #[error("output '{output}' requests vrt merge but its shape has no spatial axis")]
    VrtWithoutSpatialAxis { output: String },

    #[error("output '{output}' uses merge mode '{mode}' which requires an output directory")]
    OutputDirRequired { output: String, mode: String },

    #[error("output '{output}' uses merge mode 'merge' without an overlap policy")]
    MissingOverlapPolicy { output: String },

    #[error("merge spec references unknown output '{output}'")]
    UnknownOutput { output: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid extent: {0}")]
    Extent(String),
}

/// Per-tile failure, isolated by the scheduler.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// The executor failed for this tile. Retried up to the configured bound.
    #[error("tile execution failed: {0}")]
    Execution(String),

    /// The job was cancelled before or during execution by a run-level stop.
    #[error("tile cancelled by run stop")]
    Cancelled,
}

impl TileError {
    /// Whether the scheduler should re-queue the job.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TileError::Execution(_))
    }
}

/// Failure merging one named output. Other outputs are unaffected.
#[derive(Debug, Clone, Error)]
#[error("failed to merge output '{output}': {reason}")]
pub struct MergeError {
    /// The output the failure is scoped to.
    pub output: String,
    /// Human-readable mismatch description (dtype, resolution, CRS, shape).
    pub reason: String,
}

impl MergeError {
    pub fn new(output: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level run failure.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Write-phase failure. The caller still holds the manifest.
    #[error("output write failed: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_error_retriable() {
        assert!(TileError::Execution("boom".into()).is_retriable());
        assert!(!TileError::Cancelled.is_retriable());
    }

    #[test]
    fn test_merge_error_display() {
        let err = MergeError::new("ndvi", "resolution mismatch: 10 vs 20");
        let msg = format!("{}", err);
        assert!(msg.contains("ndvi"));
        assert!(msg.contains("resolution mismatch"));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::VrtWithoutSpatialAxis {
            output: "count".to_string(),
        };
        assert!(format!("{}", err).contains("count"));
    }
}
