//! Attribute extraction for the pool indexes
//!
//! Only configured dotted paths are indexed. How a property is indexed depends
//! on its JSON type:
//!
//! | value                      | attribute          | score         |
//! |----------------------------|--------------------|---------------|
//! | number                     | `path`             | the number    |
//! | string `s`                 | `path.s`           | creation time |
//! | `true`                     | `path`             | creation time |
//! | array of strings           | `path.s` for each  | creation time |
//! | object with numeric leaves | `path.key`         | the number    |
//!
//! `false`, `null` and anything else are skipped.

use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// One index entry derived from a request's properties
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedAttribute {
    pub attribute: String,
    /// `None` for tag attributes, which are scored by creation time
    pub score: Option<f64>,
}

impl IndexedAttribute {
    fn tag(attribute: String) -> Self {
        Self {
            attribute,
            score: None,
        }
    }

    fn scored(attribute: String, score: f64) -> Self {
        Self {
            attribute,
            score: Some(score),
        }
    }
}

/// The set of attribute paths requests are indexed by
#[derive(Debug, Clone, Default)]
pub struct IndexSchema {
    fields: Vec<String>,
}

impl IndexSchema {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Attributes `properties` should be indexed under, without duplicates
    pub fn extract(&self, properties: &Value) -> Vec<IndexedAttribute> {
        let mut seen = HashSet::new();
        let mut attributes = Vec::new();
        for path in &self.fields {
            let Some(value) = resolve(properties, path) else {
                continue;
            };
            for attribute in attributes_for(path, value) {
                if seen.insert(attribute.attribute.clone()) {
                    attributes.push(attribute);
                }
            }
        }
        attributes
    }
}

/// Look up a dotted path, preferring a literal key that contains the dots
fn resolve<'a>(properties: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = properties.get(path) {
        return Some(value);
    }
    path.split('.')
        .try_fold(properties, |node, segment| node.get(segment))
}

fn attributes_for(path: &str, value: &Value) -> Vec<IndexedAttribute> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(|score| vec![IndexedAttribute::scored(path.to_string(), score)])
            .unwrap_or_default(),
        Value::String(s) => vec![IndexedAttribute::tag(format!("{}.{}", path, s))],
        Value::Bool(true) => vec![IndexedAttribute::tag(path.to_string())],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| IndexedAttribute::tag(format!("{}.{}", path, s)))
            .collect(),
        Value::Object(children) => children
            .iter()
            .filter_map(|(key, child)| match child {
                Value::Number(n) => n
                    .as_f64()
                    .map(|score| IndexedAttribute::scored(format!("{}.{}", path, key), score)),
                Value::Bool(true) => Some(IndexedAttribute::tag(format!("{}.{}", path, key))),
                _ => None,
            })
            .collect(),
        other => {
            debug!(path, value = %other, "Skipping unindexable property");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> IndexSchema {
        IndexSchema::new(vec![
            "region".into(),
            "mode".into(),
            "mmr.rating".into(),
            "roles".into(),
            "ping".into(),
            "ranked".into(),
        ])
    }

    fn names(attributes: &[IndexedAttribute]) -> Vec<&str> {
        attributes.iter().map(|a| a.attribute.as_str()).collect()
    }

    #[test]
    fn test_string_property_becomes_tag() {
        let attributes = schema().extract(&json!({"region": "eu-west1"}));
        assert_eq!(attributes, vec![IndexedAttribute::tag("region.eu-west1".into())]);
    }

    #[test]
    fn test_nested_number_is_scored() {
        let attributes = schema().extract(&json!({"mmr": {"rating": 1500}}));
        assert_eq!(
            attributes,
            vec![IndexedAttribute::scored("mmr.rating".into(), 1500.0)]
        );
    }

    #[test]
    fn test_arrays_and_objects_expand() {
        let attributes = schema().extract(&json!({
            "roles": ["tank", "healer"],
            "ping": {"eu-west1": 35, "us-east1": 120},
            "ranked": true,
        }));
        let found = names(&attributes);
        assert!(found.contains(&"roles.tank"));
        assert!(found.contains(&"roles.healer"));
        assert!(found.contains(&"ping.eu-west1"));
        assert!(found.contains(&"ranked"));
        assert_eq!(found.len(), 5);
    }

    #[test]
    fn test_unconfigured_and_null_fields_are_skipped() {
        let attributes = schema().extract(&json!({
            "name": "alice",
            "mode": null,
            "ranked": false,
        }));
        assert!(attributes.is_empty());
    }

    #[test]
    fn test_literal_dotted_key() {
        let attributes = schema().extract(&json!({"mmr.rating": 900}));
        assert_eq!(names(&attributes), vec!["mmr.rating"]);
    }
}
