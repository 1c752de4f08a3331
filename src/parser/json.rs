//! JSON model artifacts
//!
//! ```json
//! { "elements": [
//!     { "id": "c1", "type": { "metamodel": "urn:arch", "name": "Component" },
//!       "attributes": { "name": "Gateway", "tags": ["edge", "public"] },
//!       "references": { "uses": [ { "file": { "path": "lib.model.json" }, "fragment": "db" } ] } }
//! ] }
//! ```
//!
//! Attribute values are plain JSON: strings, numbers, booleans and arrays of
//! those map onto scalar properties, objects are kept as structured values
//! and `null` means unset.

use super::ArtifactParser;
use crate::error::IndexError;
use crate::graph::model::PropertyValue;
use crate::model::{ElementRef, ElementTree, ParsedElement, TypeRef};
use crate::repository::Artifact;
use anyhow::{bail, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_SUFFIX: &str = ".model.json";

#[derive(Debug, Clone)]
pub struct JsonModelParser {
    suffix: String,
}

impl JsonModelParser {
    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl Default for JsonModelParser {
    fn default() -> Self {
        Self::with_suffix(DEFAULT_SUFFIX)
    }
}

#[derive(Deserialize)]
struct RawTree {
    #[serde(default)]
    elements: Vec<RawElement>,
}

#[derive(Deserialize)]
struct RawElement {
    id: String,
    #[serde(rename = "type")]
    type_ref: TypeRef,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
    #[serde(default)]
    references: BTreeMap<String, Vec<ElementRef>>,
}

impl ArtifactParser for JsonModelParser {
    fn name(&self) -> &str {
        "json-model"
    }

    fn can_parse(&self, path: &str) -> bool {
        path.ends_with(&self.suffix)
    }

    fn parse(&self, artifact: &Artifact) -> Result<ElementTree> {
        let failure = |reason: String| IndexError::ParseFailure {
            path: artifact.path.clone(),
            reason,
        };
        let raw: RawTree =
            serde_json::from_slice(&artifact.content).map_err(|e| failure(e.to_string()))?;

        let mut elements = Vec::with_capacity(raw.elements.len());
        for element in raw.elements {
            let mut parsed = ParsedElement::new(element.id, element.type_ref);
            for (name, value) in element.attributes {
                match convert(&value) {
                    Ok(Some(value)) => {
                        parsed.attributes.insert(name, value);
                    }
                    Ok(None) => {}
                    Err(reason) => {
                        bail!(failure(format!("attribute {} of {}: {}", name, parsed.id, reason)))
                    }
                }
            }
            parsed.references = element.references;
            elements.push(parsed);
        }
        Ok(ElementTree { elements })
    }
}

fn convert(value: &Value) -> std::result::Result<Option<PropertyValue>, String> {
    Ok(Some(match value {
        Value::Null => return Ok(None),
        Value::Bool(b) => PropertyValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => PropertyValue::Int(i),
            None => PropertyValue::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => PropertyValue::String(s.clone()),
        Value::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                if let Some(value) = convert(item)? {
                    values.push(value);
                }
            }
            let list = PropertyValue::List(values);
            if !list.is_homogeneous() {
                return Err("array mixes value types".into());
            }
            list
        }
        Value::Object(_) => PropertyValue::Json(value.clone()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(content: &str) -> Artifact {
        Artifact {
            path: "a.model.json".into(),
            revision: "r1".into(),
            content: content.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_parse_elements() {
        let parser = JsonModelParser::default();
        let tree = parser
            .parse(&artifact(
                r#"{ "elements": [
                    { "id": "c1", "type": { "metamodel": "urn:arch", "name": "Component" },
                      "attributes": { "name": "Gateway", "size": 3, "tags": ["a", "b"], "note": null },
                      "references": { "uses": [ { "fragment": "c2" } ] } },
                    { "id": "c2", "type": { "metamodel": "urn:arch", "name": "Component" } }
                ] }"#,
            ))
            .unwrap();

        assert_eq!(tree.elements.len(), 2);
        let c1 = &tree.elements[0];
        assert_eq!(c1.attributes["name"], PropertyValue::from("Gateway"));
        assert_eq!(c1.attributes["size"], PropertyValue::Int(3));
        assert_eq!(
            c1.attributes["tags"],
            PropertyValue::List(vec!["a".into(), "b".into()])
        );
        assert!(!c1.attributes.contains_key("note"));
        assert_eq!(c1.references["uses"], vec![ElementRef::local("c2")]);
    }

    #[test]
    fn test_malformed_json_is_a_parse_failure() {
        let err = JsonModelParser::default()
            .parse(&artifact("{ not json"))
            .unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(IndexError::ParseFailure { .. })
        ));
    }

    #[test]
    fn test_mixed_array_is_rejected() {
        let err = JsonModelParser::default()
            .parse(&artifact(
                r#"{ "elements": [ { "id": "x", "type": { "metamodel": "m", "name": "T" },
                     "attributes": { "tags": ["a", 1] } } ] }"#,
            ))
            .unwrap_err();
        assert!(err.to_string().contains("mixes"));
    }

    #[test]
    fn test_suffix_filter() {
        let parser = JsonModelParser::default();
        assert!(parser.can_parse("dir/a.model.json"));
        assert!(!parser.can_parse("dir/a.json"));
    }
}
