//! Normalisation of N-dimensional tile results into mergeable layers.
//!
//! Every result array is brought to at most three dimensions, (band, y, x),
//! before merging: non-spatial axes (time stamps, group keys, band names) are
//! stacked into a single labelled band axis, and results with no spatial axes
//! at all become 1x1-pixel layers. Spatial mosaicking and temporal/grouped
//! concatenation then share one code path, keyed by band label.

use crate::crs::Bounds;
use crate::executor::{DataType, DimLabel, ResultArray};
use ndarray::{Array3, Ix3, IxDyn};

/// What the stacked band axis represents, carried into artifact metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandKind {
    /// Plain 2D raster, no band axis.
    None,
    Time,
    Group,
    Band,
    /// More than one non-spatial axis stacked together.
    Stacked,
}

impl BandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BandKind::None => "none",
            BandKind::Time => "time",
            BandKind::Group => "group",
            BandKind::Band => "band",
            BandKind::Stacked => "stacked",
        }
    }
}

/// One tile's contribution to one output, normalised to (band, y, x).
#[derive(Debug, Clone)]
pub struct TileLayer {
    /// Band labels; empty for plain 2D rasters (the band axis then has size 1).
    pub bands: Vec<String>,
    pub kind: BandKind,
    pub data: Array3<f64>,
    pub bounds: Bounds,
    pub resolution: f64,
    pub crs: String,
    pub dtype: DataType,
}

impl TileLayer {
    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }
}

/// Normalise a result array into a [`TileLayer`].
///
/// Spatial axes must come last, in (y, x) order; this is part of the executor
/// contract and anything else is rejected.
pub fn normalize(array: &ResultArray) -> Result<TileLayer, String> {
    array.validate()?;

    let spatial: Vec<&DimLabel> = array.dims.iter().filter(|d| d.is_spatial()).collect();
    let nonspatial: Vec<&DimLabel> = array.dims.iter().filter(|d| !d.is_spatial()).collect();

    match spatial.as_slice() {
        [] => {}
        [DimLabel::Y, DimLabel::X] => {
            let n = array.dims.len();
            if !matches!(array.dims[n - 2], DimLabel::Y) || !matches!(array.dims[n - 1], DimLabel::X)
            {
                return Err("spatial axes must be the trailing (y, x) axes".to_string());
            }
        }
        _ => return Err("spatial axes must be exactly (y, x)".to_string()),
    }

    let (height, width) = if spatial.is_empty() {
        (1, 1)
    } else {
        let shape = array.data.shape();
        (shape[shape.len() - 2], shape[shape.len() - 1])
    };

    // Stack all non-spatial axes into one labelled band axis
    let (bands, kind) = stack_labels(&nonspatial);
    let band_count = bands.len().max(1);

    let data = array
        .data
        .to_owned()
        .into_shape_with_order(IxDyn(&[band_count, height, width]))
        .map_err(|e| format!("cannot reshape {:?} to (band, y, x): {}", array.data.shape(), e))?
        .into_dimensionality::<Ix3>()
        .map_err(|e| format!("dimensionality error: {}", e))?;

    Ok(TileLayer {
        bands,
        kind,
        data,
        bounds: array.bounds,
        resolution: array.resolution,
        crs: array.crs.clone(),
        dtype: array.dtype,
    })
}

/// Cartesian product of the labels of the stacked axes, outermost first.
fn stack_labels(nonspatial: &[&DimLabel]) -> (Vec<String>, BandKind) {
    match nonspatial {
        [] => (Vec::new(), BandKind::None),
        [single] => {
            let labels = single.labels().unwrap_or(&[]).to_vec();
            let kind = match single {
                DimLabel::Time(_) => BandKind::Time,
                DimLabel::Group(_) => BandKind::Group,
                DimLabel::Band(_) => BandKind::Band,
                DimLabel::Y | DimLabel::X => unreachable!("spatial axes filtered out"),
            };
            (labels, kind)
        }
        many => {
            let mut combined = vec![String::new()];
            for dim in many {
                let labels = dim.labels().unwrap_or(&[]);
                let mut next = Vec::with_capacity(combined.len() * labels.len().max(1));
                for prefix in &combined {
                    for label in labels {
                        if prefix.is_empty() {
                            next.push(label.clone());
                        } else {
                            next.push(format!("{}|{}", prefix, label));
                        }
                    }
                }
                combined = next;
            }
            (combined, BandKind::Stacked)
        }
    }
}
