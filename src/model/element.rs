//! Element tree: the generic representation every artifact parser produces.

use crate::graph::model::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parsed content of one artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementTree {
    #[serde(default)]
    pub elements: Vec<ParsedElement>,
}

impl ElementTree {
    /// Distinct metamodel URIs the tree's elements conform to.
    pub fn metamodels(&self) -> Vec<&str> {
        let mut uris: Vec<&str> = self
            .elements
            .iter()
            .map(|e| e.type_ref.metamodel.as_str())
            .collect();
        uris.sort_unstable();
        uris.dedup();
        uris
    }
}

/// `(metamodel uri, type name)` pair naming an element's type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeRef {
    pub metamodel: String,
    pub name: String,
}

impl TypeRef {
    pub fn new(metamodel: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metamodel: metamodel.into(),
            name: name.into(),
        }
    }
}

/// One model instance within an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedElement {
    /// Fragment id, unique within the artifact.
    pub id: String,
    #[serde(rename = "type")]
    pub type_ref: TypeRef,
    #[serde(default)]
    pub attributes: BTreeMap<String, PropertyValue>,
    #[serde(default)]
    pub references: BTreeMap<String, Vec<ElementRef>>,
}

impl ParsedElement {
    pub fn new(id: impl Into<String>, type_ref: TypeRef) -> Self {
        Self {
            id: id.into(),
            type_ref,
            attributes: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_reference(mut self, feature: &str, target: ElementRef) -> Self {
        self.references
            .entry(feature.to_string())
            .or_default()
            .push(target);
        self
    }
}

/// Target of a reference. Without `file` the target lives in the same
/// artifact; a locator without `repository` stays in the same repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileLocator>,
    pub fragment: String,
}

impl ElementRef {
    pub fn local(fragment: impl Into<String>) -> Self {
        Self {
            file: None,
            fragment: fragment.into(),
        }
    }

    pub fn in_file(path: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            file: Some(FileLocator {
                repository: None,
                path: path.into(),
            }),
            fragment: fragment.into(),
        }
    }

    /// Key of the file holding the target, seen from `(repository, path)`.
    pub fn file_key(&self, repository: &str, path: &str) -> String {
        match &self.file {
            None => file_key(repository, path),
            Some(locator) => file_key(
                locator.repository.as_deref().unwrap_or(repository),
                &locator.path,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    pub path: String,
}

/// Identity of an artifact across repositories.
pub fn file_key(repository: &str, path: &str) -> String {
    format!("{}::{}", repository, path)
}
