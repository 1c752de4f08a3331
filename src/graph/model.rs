//! Graph data model: identities, property values, nodes and edges

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Identities
// ============================================================================

/// Opaque node identity allocated by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Opaque edge identity allocated by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

// ============================================================================
// Property values
// ============================================================================

/// A property value: a scalar, a homogeneous array, or a structured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
    /// Structured property, used for fixed-shape records such as proxy
    /// markers and derived-attribute values.
    Json(serde_json::Value),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Int(i) => Some(*i as f64),
            PropertyValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Flatten a value into the scalars an index should hold.
    pub fn scalars(&self) -> Vec<&PropertyValue> {
        match self {
            PropertyValue::List(items) => items.iter().flat_map(|v| v.scalars()).collect(),
            other => vec![other],
        }
    }

    /// Text form used by the tokenized index structure.
    pub fn index_text(&self) -> String {
        match self {
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::String(s) => s.clone(),
            PropertyValue::List(items) => items
                .iter()
                .map(|v| v.index_text())
                .collect::<Vec<_>>()
                .join(","),
            PropertyValue::Json(v) => v.to_string(),
        }
    }

    /// Whether every element of a list shares one variant.
    pub fn is_homogeneous(&self) -> bool {
        match self {
            PropertyValue::List(items) => items
                .windows(2)
                .all(|w| std::mem::discriminant(&w[0]) == std::mem::discriminant(&w[1])),
            _ => true,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// Property bag attached to nodes and edges.
pub type Properties = BTreeMap<String, PropertyValue>;

// ============================================================================
// Nodes and edges
// ============================================================================

/// A labelled node with its property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub label: String,
    pub properties: Properties,
}

impl GraphNode {
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn string_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(PropertyValue::as_str)
    }
}

/// A directed, labelled edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: EdgeId,
    pub label: String,
    pub start: NodeId,
    pub end: NodeId,
    pub properties: Properties,
}

impl GraphEdge {
    pub fn flag(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false)
    }

    /// The node at the other end of the edge, seen from `from`.
    pub fn other(&self, from: NodeId) -> NodeId {
        if self.start == from {
            self.end
        } else {
            self.start
        }
    }
}

/// Edge navigation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

// ============================================================================
// Reserved labels and property keys
// ============================================================================

/// Node labels.
pub mod labels {
    pub const FILE: &str = "file";
    pub const ELEMENT: &str = "element";
    pub const TYPE: &str = "type";
    pub const METAMODEL: &str = "metamodel";
    pub const DERIVED: &str = "derivedattribute";
    pub const REPOSITORY: &str = "repository";
}

/// Reserved edge labels. Element features never start with an underscore.
pub mod edges {
    /// element -> file it belongs to
    pub const FILE: &str = "_file";
    /// element -> type node ("instance-of")
    pub const OF_TYPE: &str = "_ofType";
    /// type -> metamodel
    pub const METAMODEL: &str = "_metamodel";
}

/// Reserved property keys.
pub mod props {
    /// Fragment id of an element node.
    pub const ID: &str = "_id";
    pub const URI: &str = "uri";
    pub const NAME: &str = "name";
    pub const PATH: &str = "path";
    pub const REPOSITORY: &str = "repository";
    pub const REVISION: &str = "revision";
    pub const FEATURES: &str = "features";
    pub const SUPERTYPES: &str = "supertypes";
    pub const SINGLETON: &str = "singleton";
    pub const DEPENDS_ON: &str = "depends_on";
    pub const CONTAINMENT: &str = "containment";
    pub const CONTAINER: &str = "container";
    pub const IS_DERIVED: &str = "is_derived";
    pub const DERIVED_VALUE: &str = "derived_value";
    pub const ATTRIBUTE: &str = "attribute";
    pub const LOCATION: &str = "location";
    pub const KIND: &str = "kind";
    pub const METAMODEL: &str = "metamodel";
    pub const INDEXED: &str = "indexed";
    pub const LANGUAGE: &str = "language";
    pub const EXPRESSION: &str = "expression";
    /// Prefix of the per-target-file proxy marker properties.
    pub const PROXY_PREFIX: &str = "_proxyRef:";
}

/// Engine-maintained index names. Application indexes never start with an
/// underscore.
pub mod indexes {
    /// field = repository location, value = path -> file node
    pub const FILES: &str = "_files";
    /// field "key", value = file key -> file node
    pub const FILE_KEYS: &str = "_filekeys";
    /// field = file key, value = fragment id -> element node
    pub const FRAGMENTS: &str = "_fragments";
    /// field = "uri#Type", value = fragment id -> shared element node
    pub const SINGLETONS: &str = "_singletons";
    /// field "target", value = target file key -> referencing element node
    pub const PROXIES: &str = "_proxies";
    /// field "uri", value = metamodel uri -> metamodel node
    pub const METAMODELS: &str = "_metamodels";
    /// field = metamodel uri, value = type name -> type node
    pub const TYPES: &str = "_types";
    /// field = element id, value = attribute read -> derived attribute node
    pub const DERIVED_ACCESS: &str = "_derivedaccess";
    /// field "stale" -> derived attribute nodes holding the stale sentinel
    pub const STALE: &str = "_stale";
    /// field "location", value = repository location -> repository node
    pub const REPOSITORIES: &str = "_repositories";

    pub const KEY_FIELD: &str = "key";
    pub const TARGET_FIELD: &str = "target";
    pub const URI_FIELD: &str = "uri";
    pub const STALE_FIELD: &str = "stale";
    pub const LOCATION_FIELD: &str = "location";

    /// Per-type index holding one attribute's values.
    pub fn attribute_index(metamodel: &str, type_name: &str, attribute: &str) -> String {
        format!("{}##{}##{}", metamodel, type_name, attribute)
    }
}

/// Whether an edge label is reserved for engine bookkeeping.
pub fn is_reserved_label(label: &str) -> bool {
    label.starts_with('_')
}
