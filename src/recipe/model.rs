//! Recipe expression tree.
//!
//! A recipe maps output names to expression trees. The tree is built once at
//! parse time and walked without mutation during execution; verb dispatch is
//! a closed enum rather than anything dynamic.

use std::collections::BTreeMap;

/// A parsed recipe: output name -> expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    outputs: BTreeMap<String, Expr>,
}

impl Recipe {
    pub fn new(outputs: BTreeMap<String, Expr>) -> Self {
        Self { outputs }
    }

    /// Output names in deterministic (sorted) order.
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.keys().map(|s| s.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Expr> {
        self.outputs.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Expr)> {
        self.outputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// A node in the recipe expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Symbolic reference to a catalogued data layer, e.g.
    /// ["Planetary", "reflectance", "s2_band04"].
    Layer { reference: Vec<String> },

    /// Symbolic reference to a semantic concept, e.g. ["entity", "water"].
    Concept { reference: Vec<String> },

    /// Ordered list of sources evaluated together.
    Collection { elements: Vec<Expr> },

    /// A source plus an ordered list of verbs applied to it.
    Chain { with: Box<Expr>, steps: Vec<Verb> },

    /// Back-reference to the active chain's current value.
    SelfRef,
}

/// A processing verb with its typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    /// Keep only cells where the filterer expression is truthy.
    Filter { filterer: Expr },

    /// Collapse a dimension with a named reducer (e.g. "median" over "time").
    Reduce {
        reducer: String,
        dimension: Option<String>,
    },

    /// Split along the distinct values of the grouper expression.
    Groupby { grouper: Expr },

    /// Re-merge a grouped collection along a new dimension.
    Concatenate { dimension: String },

    /// Extract the coordinate values of a dimension (optionally one component,
    /// e.g. the "year" component of "time").
    Extract {
        dimension: String,
        component: Option<String>,
    },
}

impl Verb {
    /// The dimension this verb operates over, if it names one.
    pub fn dimension(&self) -> Option<&str> {
        match self {
            Verb::Reduce { dimension, .. } => dimension.as_deref(),
            Verb::Concatenate { dimension } => Some(dimension),
            Verb::Extract { dimension, .. } => Some(dimension),
            Verb::Filter { .. } | Verb::Groupby { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_names_sorted() {
        let mut outputs = BTreeMap::new();
        outputs.insert("zeta".to_string(), Expr::SelfRef);
        outputs.insert("alpha".to_string(), Expr::SelfRef);
        let recipe = Recipe::new(outputs);
        assert_eq!(recipe.output_names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_verb_dimension() {
        let v = Verb::Reduce {
            reducer: "median".to_string(),
            dimension: Some("time".to_string()),
        };
        assert_eq!(v.dimension(), Some("time"));

        let v = Verb::Filter {
            filterer: Expr::SelfRef,
        };
        assert_eq!(v.dimension(), None);
    }
}
