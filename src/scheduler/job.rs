//! Job bookkeeping and the run manifest.

use crate::error::TileError;
use crate::partition::Tile;

/// One unit of scheduled work: a tile plus how many attempts it has consumed.
#[derive(Debug, Clone)]
pub struct Job {
    pub tile: Tile,

    /// Completed (failed) attempts so far; 0 for a fresh job.
    pub attempt: usize,
}

/// Lifecycle state of a job, tracked by the scheduler only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A tile that reached `succeeded`.
#[derive(Debug, Clone)]
pub struct TileOutcome {
    pub tile_id: String,

    /// Total attempts consumed, including the successful one.
    pub attempts: usize,
}

/// A tile that exhausted its retries or was cancelled.
#[derive(Debug, Clone)]
pub struct TileFailure {
    pub tile_id: String,
    pub attempts: usize,

    /// The terminal error of the last attempt.
    pub error: TileError,
}

/// The scheduler's final accounting for one run.
///
/// Every tile handed to the scheduler appears in exactly one of the two
/// partitions.
#[derive(Debug, Default)]
pub struct Manifest {
    pub succeeded: Vec<TileOutcome>,
    pub failed: Vec<TileFailure>,
}

impl Manifest {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_fully_successful(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn succeeded_ids(&self) -> impl Iterator<Item = &str> {
        self.succeeded.iter().map(|o| o.tile_id.as_str())
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.tile_id.as_str())
    }
}

impl std::fmt::Display for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Succeeded: {}, Failed: {}, Total: {}",
            self.succeeded.len(),
            self.failed.len(),
            self.total()
        )
    }
}
