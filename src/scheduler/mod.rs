//! Tile scheduling: bounded worker pool, retries and the run manifest.

mod job;
mod pool;

pub use job::{Job, JobStatus, Manifest, TileFailure, TileOutcome};
pub use pool::{
    CompletedTile, SchedulerConfig, StopHandle, StopMode, StopSignal, TileScheduler,
};
