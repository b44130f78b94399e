//! Recursive-descent parser from the JSON recipe document to the typed tree.
//!
//! Recipe documents are maps from output name to a `type`-tagged node:
//!
//! ```json
//! {
//!   "composite": {
//!     "type": "processing_chain",
//!     "with": {"type": "layer", "reference": ["Planetary", "reflectance", "s2_band04"]},
//!     "do": [
//!       {"type": "verb", "name": "reduce",
//!        "params": {"reducer": "median", "dimension": "time"}}
//!     ]
//!   }
//! }
//! ```
//!
//! Unknown node or verb kinds are reported with the JSON path that carries
//! them so malformed recipes fail before any tile is dispatched.

use super::model::{Expr, Recipe, Verb};
use crate::error::ValidationError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Parse a recipe document.
pub fn parse_recipe(doc: &Value) -> Result<Recipe, ValidationError> {
    let map = doc
        .as_object()
        .ok_or_else(|| err("$", "recipe document must be a JSON object"))?;

    if map.is_empty() {
        return Err(err("$", "recipe defines no outputs"));
    }

    let mut outputs = BTreeMap::new();
    for (name, node) in map {
        let expr = parse_expr(node, name)?;
        outputs.insert(name.clone(), expr);
    }
    Ok(Recipe::new(outputs))
}

fn parse_expr(node: &Value, path: &str) -> Result<Expr, ValidationError> {
    let obj = node
        .as_object()
        .ok_or_else(|| err(path, "expected an object node"))?;

    let kind = obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| err(path, "node is missing a 'type' tag"))?;

    match kind {
        "layer" => Ok(Expr::Layer {
            reference: parse_reference(obj.get("reference"), path)?,
        }),
        "concept" => Ok(Expr::Concept {
            reference: parse_reference(obj.get("reference"), path)?,
        }),
        "self" => Ok(Expr::SelfRef),
        "collection" => {
            let elements = obj
                .get("elements")
                .and_then(|v| v.as_array())
                .ok_or_else(|| err(path, "collection is missing 'elements' array"))?;
            if elements.is_empty() {
                return Err(err(path, "collection has no elements"));
            }
            let elements = elements
                .iter()
                .enumerate()
                .map(|(i, e)| parse_expr(e, &format!("{}.elements[{}]", path, i)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::Collection { elements })
        }
        "processing_chain" => {
            let with = obj
                .get("with")
                .ok_or_else(|| err(path, "processing_chain is missing 'with'"))?;
            let with = parse_expr(with, &format!("{}.with", path))?;

            let steps = obj
                .get("do")
                .and_then(|v| v.as_array())
                .ok_or_else(|| err(path, "processing_chain is missing 'do' array"))?;
            let steps = steps
                .iter()
                .enumerate()
                .map(|(i, v)| parse_verb(v, &format!("{}.do[{}]", path, i)))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Expr::Chain {
                with: Box::new(with),
                steps,
            })
        }
        other => Err(err(path, &format!("unknown node type '{}'", other))),
    }
}

fn parse_verb(node: &Value, path: &str) -> Result<Verb, ValidationError> {
    let obj = node
        .as_object()
        .ok_or_else(|| err(path, "expected a verb object"))?;

    match obj.get("type").and_then(|v| v.as_str()) {
        Some("verb") => {}
        _ => return Err(err(path, "chain step is not a 'verb' node")),
    }

    let name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| err(path, "verb is missing 'name'"))?;

    let empty = Value::Object(Default::default());
    let params = obj.get("params").unwrap_or(&empty);
    let params = params
        .as_object()
        .ok_or_else(|| err(path, "verb 'params' must be an object"))?;

    let get_str = |key: &str| params.get(key).and_then(|v| v.as_str()).map(str::to_string);

    match name {
        "filter" => {
            let filterer = params
                .get("filterer")
                .ok_or_else(|| err(path, "filter verb is missing 'filterer'"))?;
            Ok(Verb::Filter {
                filterer: parse_expr(filterer, &format!("{}.filterer", path))?,
            })
        }
        "reduce" => {
            let reducer = get_str("reducer")
                .ok_or_else(|| err(path, "reduce verb is missing 'reducer'"))?;
            Ok(Verb::Reduce {
                reducer,
                dimension: get_str("dimension"),
            })
        }
        "groupby" => {
            let grouper = params
                .get("grouper")
                .ok_or_else(|| err(path, "groupby verb is missing 'grouper'"))?;
            Ok(Verb::Groupby {
                grouper: parse_expr(grouper, &format!("{}.grouper", path))?,
            })
        }
        "concatenate" => {
            let dimension = get_str("dimension")
                .ok_or_else(|| err(path, "concatenate verb is missing 'dimension'"))?;
            Ok(Verb::Concatenate { dimension })
        }
        "extract" => {
            let dimension = get_str("dimension")
                .ok_or_else(|| err(path, "extract verb is missing 'dimension'"))?;
            Ok(Verb::Extract {
                dimension,
                component: get_str("component"),
            })
        }
        other => Err(err(path, &format!("unknown verb '{}'", other))),
    }
}

fn parse_reference(value: Option<&Value>, path: &str) -> Result<Vec<String>, ValidationError> {
    let arr = value
        .and_then(|v| v.as_array())
        .ok_or_else(|| err(path, "missing 'reference' array"))?;
    let parts = arr
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| err(path, "'reference' must be an array of strings"))?;
    if parts.is_empty() {
        return Err(err(path, "'reference' is empty"));
    }
    Ok(parts)
}

fn err(path: &str, message: &str) -> ValidationError {
    ValidationError::Recipe {
        path: path.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reduce_chain() {
        let doc = json!({
            "composite": {
                "type": "processing_chain",
                "with": {"type": "layer", "reference": ["Planetary", "reflectance", "s2_band04"]},
                "do": [
                    {"type": "verb", "name": "reduce",
                     "params": {"reducer": "median", "dimension": "time"}}
                ]
            }
        });

        let recipe = parse_recipe(&doc).unwrap();
        assert_eq!(recipe.output_names(), vec!["composite"]);

        match recipe.get("composite").unwrap() {
            Expr::Chain { with, steps } => {
                assert!(matches!(**with, Expr::Layer { .. }));
                assert_eq!(steps.len(), 1);
                assert!(matches!(
                    &steps[0],
                    Verb::Reduce { reducer, dimension }
                        if reducer == "median" && dimension.as_deref() == Some("time")
                ));
            }
            other => panic!("unexpected expr: {:?}", other),
        }
    }

    #[test]
    fn test_parse_groupby_with_collection_grouper() {
        let doc = json!({
            "monthly": {
                "type": "processing_chain",
                "with": {"type": "concept", "reference": ["entity", "vegetation"]},
                "do": [
                    {"type": "verb", "name": "groupby", "params": {"grouper": {
                        "type": "collection",
                        "elements": [
                            {"type": "processing_chain",
                             "with": {"type": "self"},
                             "do": [{"type": "verb", "name": "extract",
                                     "params": {"dimension": "time", "component": "year"}}]},
                            {"type": "processing_chain",
                             "with": {"type": "self"},
                             "do": [{"type": "verb", "name": "extract",
                                     "params": {"dimension": "time", "component": "month"}}]}
                        ]
                    }}},
                    {"type": "verb", "name": "reduce",
                     "params": {"reducer": "count", "dimension": "time"}}
                ]
            }
        });

        let recipe = parse_recipe(&doc).unwrap();
        match recipe.get("monthly").unwrap() {
            Expr::Chain { steps, .. } => {
                assert!(matches!(&steps[0], Verb::Groupby { grouper: Expr::Collection { elements } }
                    if elements.len() == 2));
            }
            other => panic!("unexpected expr: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_verb() {
        let doc = json!({
            "bad": {
                "type": "processing_chain",
                "with": {"type": "self"},
                "do": [{"type": "verb", "name": "transmogrify", "params": {}}]
            }
        });
        let res = parse_recipe(&doc);
        let msg = format!("{}", res.unwrap_err());
        assert!(msg.contains("transmogrify"));
        assert!(msg.contains("bad.do[0]"));
    }

    #[test]
    fn test_parse_rejects_unknown_node_type() {
        let doc = json!({"bad": {"type": "oracle"}});
        assert!(parse_recipe(&doc).is_err());
    }

    #[test]
    fn test_parse_rejects_empty_document() {
        let doc = json!({});
        assert!(parse_recipe(&doc).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_reducer() {
        let doc = json!({
            "bad": {
                "type": "processing_chain",
                "with": {"type": "self"},
                "do": [{"type": "verb", "name": "reduce", "params": {"dimension": "time"}}]
            }
        });
        assert!(parse_recipe(&doc).is_err());
    }
}
