//! Recombining per-tile results into per-output artifacts.

mod layer;
mod merger;
mod mosaic;
mod vrt;

pub use layer::{BandKind, TileLayer};
pub use merger::{MergeReport, MergedOutput, OutputGridSpec, ResultMerger};
pub use mosaic::MosaicCanvas;
pub use vrt::{VrtIndex, VrtTile};

use serde::{Deserialize, Serialize};

/// How one output's per-tile results are recombined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Mosaic tiles into one raster per group slice.
    Merge,

    /// Keep per-tile files and build a lightweight spatial index over them.
    Vrt,

    /// Keep each tile's result as an independent artifact.
    None,
}

impl std::fmt::Display for MergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MergeMode::Merge => "merge",
            MergeMode::Vrt => "vrt",
            MergeMode::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Resolution of pixels covered by more than one tile (margin overlap).
///
/// Deliberately has no default: the choice changes results, so configurations
/// must make it explicitly for every `merge`-mode output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// The tile with the highest rank in a fixed, completion-order-independent
    /// ordering (lexicographic tile id) wins the pixel.
    LastWins,

    /// Overlapping contributions are averaged.
    Average,
}

/// Per-output merge configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MergeSpec {
    pub mode: MergeMode,

    /// Required when `mode` is `merge`; ignored otherwise.
    #[serde(default)]
    pub overlap: Option<OverlapPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_spec_deserializes() {
        let spec: MergeSpec = serde_yaml::from_str("mode: merge\noverlap: last_wins\n").unwrap();
        assert_eq!(spec.mode, MergeMode::Merge);
        assert_eq!(spec.overlap, Some(OverlapPolicy::LastWins));
    }

    #[test]
    fn test_merge_spec_overlap_optional_in_serde() {
        // Presence is enforced by run validation, not by the parser
        let spec: MergeSpec = serde_yaml::from_str("mode: vrt\n").unwrap();
        assert_eq!(spec.mode, MergeMode::Vrt);
        assert!(spec.overlap.is_none());
    }

    #[test]
    fn test_merge_mode_display() {
        assert_eq!(MergeMode::Vrt.to_string(), "vrt");
        assert_eq!(MergeMode::None.to_string(), "none");
    }
}
