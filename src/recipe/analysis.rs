//! Static analysis of recipe trees.
//!
//! Two questions are answered before any tile is dispatched: which dimension
//! classes the recipe's verbs operate over (this decides which dimensions are
//! safe to tile along), and what shape each output retains (this decides
//! whether a vrt merge is even possible for it).

use super::model::{Expr, Recipe, Verb};
use std::collections::BTreeSet;

/// Classification of a dimension name into the two tileable axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DimClass {
    Time,
    Space,
}

/// Map a dimension or component name onto a tileable axis.
///
/// Component names (year, month, ...) count as temporal because extracting
/// them still requires the full time range to be present in every tile.
fn classify(dim: &str) -> Option<DimClass> {
    match dim {
        "time" | "year" | "season" | "quarter" | "month" | "week" | "day" | "dayofyear"
        | "hour" => Some(DimClass::Time),
        "space" | "x" | "y" | "feature" => Some(DimClass::Space),
        _ => None,
    }
}

/// Collect the dimension classes all verbs in the tree operate over.
pub fn operated_dims(expr: &Expr) -> BTreeSet<DimClass> {
    let mut dims = BTreeSet::new();
    walk_dims(expr, &mut dims);
    dims
}

fn walk_dims(expr: &Expr, dims: &mut BTreeSet<DimClass>) {
    match expr {
        Expr::Layer { .. } | Expr::Concept { .. } | Expr::SelfRef => {}
        Expr::Collection { elements } => {
            for e in elements {
                walk_dims(e, dims);
            }
        }
        Expr::Chain { with, steps } => {
            walk_dims(with, dims);
            for verb in steps {
                if let Some(dim) = verb.dimension() {
                    if let Some(class) = classify(dim) {
                        dims.insert(class);
                    }
                }
                if let Verb::Extract {
                    component: Some(component),
                    ..
                } = verb
                {
                    if let Some(class) = classify(component) {
                        dims.insert(class);
                    }
                }
                match verb {
                    Verb::Filter { filterer } => walk_dims(filterer, dims),
                    Verb::Groupby { grouper } => walk_dims(grouper, dims),
                    _ => {}
                }
            }
        }
    }
}

/// Which axes may be chunked for this recipe.
///
/// Chunking an axis the recipe operates over would change semantics (a median
/// over time computed per time chunk is not the median over the full range),
/// so that axis is kept whole. A recipe operating over both axes runs as a
/// single whole-extent tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDims {
    pub space: bool,
    pub time: bool,
}

pub fn tile_dims(recipe: &Recipe) -> TileDims {
    let mut dims = BTreeSet::new();
    for (_, expr) in recipe.iter() {
        dims.extend(operated_dims(expr));
    }
    TileDims {
        space: !dims.contains(&DimClass::Space),
        time: !dims.contains(&DimClass::Time),
    }
}

/// The shape an output retains after its chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputShape {
    /// Output still carries y/x raster axes.
    pub spatial: bool,
    /// Output still carries a time axis.
    pub temporal: bool,
    /// Output carries a group axis introduced by groupby without a
    /// following concatenate.
    pub grouped: bool,
}

/// Infer the retained shape of one output's expression tree.
pub fn output_shape(expr: &Expr) -> OutputShape {
    let mut shape = source_shape(expr);
    if let Expr::Chain { steps, .. } = expr {
        for verb in steps {
            apply_verb(&mut shape, verb);
        }
    }
    shape
}

fn source_shape(expr: &Expr) -> OutputShape {
    match expr {
        // Raster sources start with both axes present.
        Expr::Layer { .. } | Expr::Concept { .. } | Expr::SelfRef => OutputShape {
            spatial: true,
            temporal: true,
            grouped: false,
        },
        Expr::Collection { elements } => elements
            .first()
            .map(output_shape)
            .unwrap_or(OutputShape {
                spatial: true,
                temporal: true,
                grouped: false,
            }),
        Expr::Chain { with, .. } => output_shape(with),
    }
}

fn apply_verb(shape: &mut OutputShape, verb: &Verb) {
    match verb {
        Verb::Filter { .. } => {}
        Verb::Reduce { dimension, .. } => match dimension.as_deref().and_then(classify) {
            Some(DimClass::Time) => shape.temporal = false,
            Some(DimClass::Space) => shape.spatial = false,
            None => {}
        },
        Verb::Groupby { .. } => shape.grouped = true,
        Verb::Concatenate { .. } => shape.grouped = false,
        Verb::Extract { dimension, .. } => {
            // Extraction yields the coordinate values of one dimension.
            let class = classify(dimension);
            shape.spatial = class == Some(DimClass::Space);
            shape.temporal = class == Some(DimClass::Time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::parse_recipe;
    use serde_json::json;

    fn recipe_from(doc: serde_json::Value) -> Recipe {
        parse_recipe(&doc).unwrap()
    }

    fn chain_reduce(dimension: &str) -> serde_json::Value {
        json!({
            "out": {
                "type": "processing_chain",
                "with": {"type": "layer", "reference": ["l"]},
                "do": [{"type": "verb", "name": "reduce",
                        "params": {"reducer": "mean", "dimension": dimension}}]
            }
        })
    }

    #[test]
    fn test_reduce_over_time_allows_spatial_tiling_only() {
        let recipe = recipe_from(chain_reduce("time"));
        let dims = tile_dims(&recipe);
        assert!(dims.space);
        assert!(!dims.time);
    }

    #[test]
    fn test_reduce_over_space_allows_temporal_tiling_only() {
        let recipe = recipe_from(chain_reduce("space"));
        let dims = tile_dims(&recipe);
        assert!(!dims.space);
        assert!(dims.time);
    }

    #[test]
    fn test_no_operated_dims_allows_both() {
        let doc = json!({
            "out": {"type": "layer", "reference": ["l"]}
        });
        let dims = tile_dims(&recipe_from(doc));
        assert!(dims.space);
        assert!(dims.time);
    }

    #[test]
    fn test_grouper_component_counts_as_temporal() {
        let doc = json!({
            "out": {
                "type": "processing_chain",
                "with": {"type": "layer", "reference": ["l"]},
                "do": [{"type": "verb", "name": "groupby", "params": {"grouper": {
                    "type": "processing_chain",
                    "with": {"type": "self"},
                    "do": [{"type": "verb", "name": "extract",
                            "params": {"dimension": "time", "component": "year"}}]
                }}}]
            }
        });
        let recipe = recipe_from(doc);
        assert!(!tile_dims(&recipe).time);
        assert!(tile_dims(&recipe).space);
    }

    #[test]
    fn test_shape_reduce_over_time_stays_spatial() {
        let recipe = recipe_from(chain_reduce("time"));
        let shape = output_shape(recipe.get("out").unwrap());
        assert!(shape.spatial);
        assert!(!shape.temporal);
        assert!(!shape.grouped);
    }

    #[test]
    fn test_shape_reduce_over_space_is_timeseries() {
        let recipe = recipe_from(chain_reduce("space"));
        let shape = output_shape(recipe.get("out").unwrap());
        assert!(!shape.spatial);
        assert!(shape.temporal);
    }

    #[test]
    fn test_shape_groupby_without_concatenate_is_grouped() {
        let doc = json!({
            "out": {
                "type": "processing_chain",
                "with": {"type": "layer", "reference": ["l"]},
                "do": [
                    {"type": "verb", "name": "groupby", "params": {"grouper": {
                        "type": "processing_chain",
                        "with": {"type": "self"},
                        "do": [{"type": "verb", "name": "extract",
                                "params": {"dimension": "time", "component": "month"}}]
                    }}},
                    {"type": "verb", "name": "reduce",
                     "params": {"reducer": "mean", "dimension": "time"}}
                ]
            }
        });
        let recipe = recipe_from(doc);
        let shape = output_shape(recipe.get("out").unwrap());
        assert!(shape.grouped);
        assert!(shape.spatial);
        assert!(!shape.temporal);
    }

    #[test]
    fn test_shape_concatenate_remerges_groups() {
        let doc = json!({
            "out": {
                "type": "processing_chain",
                "with": {"type": "layer", "reference": ["l"]},
                "do": [
                    {"type": "verb", "name": "groupby", "params": {"grouper": {
                        "type": "processing_chain",
                        "with": {"type": "self"},
                        "do": [{"type": "verb", "name": "extract",
                                "params": {"dimension": "time", "component": "year"}}]
                    }}},
                    {"type": "verb", "name": "reduce",
                     "params": {"reducer": "mean", "dimension": "time"}},
                    {"type": "verb", "name": "concatenate",
                     "params": {"dimension": "year"}}
                ]
            }
        });
        let recipe = recipe_from(doc);
        let shape = output_shape(recipe.get("out").unwrap());
        assert!(!shape.grouped);
    }
}
