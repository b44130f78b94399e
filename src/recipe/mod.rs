//! Declarative query recipes: expression trees of verbs over data sources.

mod analysis;
mod model;
mod parse;

pub use analysis::{operated_dims, output_shape, tile_dims, DimClass, OutputShape, TileDims};
pub use model::{Expr, Recipe, Verb};
pub use parse::parse_recipe;
