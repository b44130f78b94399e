//! Artifact persistence.

mod writer;

pub use writer::{OutputWriter, RasterArtifact};
