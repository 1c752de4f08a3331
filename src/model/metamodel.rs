//! Metamodels and their type system.
//!
//! A registered metamodel becomes one metamodel node plus one type node per
//! declared type, linked by `_metamodel` edges. The structural features of a
//! type are stored as a closed, explicitly tagged variant list on the type
//! node and resolved once per type by the updater's type cache.

use crate::error::IndexError;
use crate::graph::backend::{GraphBackend, GraphBackendExt};
use crate::graph::model::{edges, indexes, labels, props, Direction, NodeId, Properties, PropertyValue};
use crate::index::IndexQuery;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// Definitions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metamodel {
    pub uri: String,
    /// Metamodels this one builds on; they must be registered first (or in
    /// the same call).
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub types: Vec<TypeDef>,
}

impl Metamodel {
    /// Load a metamodel from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read metamodel {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid metamodel {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    /// Supertype names within the same metamodel.
    #[serde(default)]
    pub supertypes: Vec<String>,
    #[serde(default)]
    pub features: Vec<FeatureDef>,
    /// Instances are shared across files by fragment id.
    #[serde(default)]
    pub singleton: bool,
}

/// A structural feature of a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureDef {
    Attribute(AttributeDef),
    Reference(ReferenceDef),
    Derived(DerivedDef),
}

impl FeatureDef {
    pub fn name(&self) -> &str {
        match self {
            FeatureDef::Attribute(a) => &a.name,
            FeatureDef::Reference(r) => &r.name,
            FeatureDef::Derived(d) => &d.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub many: bool,
    #[serde(default)]
    pub ordered: bool,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDef {
    pub name: String,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub many: bool,
    #[serde(default)]
    pub containment: bool,
    #[serde(default)]
    pub container: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedDef {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub many: bool,
    #[serde(default)]
    pub ordered: bool,
    #[serde(default)]
    pub unique: bool,
    /// Evaluator language id.
    pub language: String,
    pub expression: String,
}

/// A derived attribute attached to a type after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedAttributeSpec {
    pub metamodel: String,
    pub type_name: String,
    #[serde(flatten)]
    pub attribute: DerivedDef,
}

// ============================================================================
// Registry
// ============================================================================

/// Reads and writes the type system stored in the graph.
///
/// Mutating methods require an open write context on the backend.
#[derive(Clone)]
pub struct MetamodelRegistry {
    backend: Arc<dyn GraphBackend>,
}

impl MetamodelRegistry {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self { backend }
    }

    /// URIs of every registered metamodel.
    pub async fn registered(&self) -> Result<Vec<String>> {
        Ok(self
            .backend
            .index_values(indexes::METAMODELS, indexes::URI_FIELD)
            .await?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    pub async fn metamodel_node(&self, uri: &str) -> Result<Option<NodeId>> {
        self.backend
            .index_lookup(indexes::METAMODELS, indexes::URI_FIELD, uri)
            .await
    }

    pub async fn is_registered(&self, uri: &str) -> Result<bool> {
        Ok(self.metamodel_node(uri).await?.is_some())
    }

    pub async fn type_node(&self, metamodel: &str, name: &str) -> Result<Option<NodeId>> {
        self.backend.index_lookup(indexes::TYPES, metamodel, name).await
    }

    pub async fn type_nodes(&self, metamodel: &str) -> Result<Vec<NodeId>> {
        self.backend
            .index_nodes(indexes::TYPES, metamodel, &IndexQuery::all())
            .await
    }

    /// Register metamodels, skipping those already present. Returns the URIs
    /// that were added.
    pub async fn register(&self, metamodels: &[Metamodel]) -> Result<Vec<String>> {
        let batch: BTreeSet<&str> = metamodels.iter().map(|m| m.uri.as_str()).collect();
        for metamodel in metamodels {
            for dependency in &metamodel.depends_on {
                if !batch.contains(dependency.as_str()) && !self.is_registered(dependency).await? {
                    bail!(IndexError::MetamodelNotRegistered {
                        uri: dependency.clone()
                    });
                }
            }
        }

        let mut added = Vec::new();
        for metamodel in metamodels {
            if self.is_registered(&metamodel.uri).await? {
                debug!(uri = %metamodel.uri, "Metamodel already registered");
                continue;
            }
            self.store(metamodel).await?;
            info!(uri = %metamodel.uri, types = metamodel.types.len(), "Registered metamodel");
            added.push(metamodel.uri.clone());
        }
        Ok(added)
    }

    async fn store(&self, metamodel: &Metamodel) -> Result<()> {
        let mut properties = Properties::new();
        properties.insert(props::URI.into(), metamodel.uri.clone().into());
        properties.insert(
            props::DEPENDS_ON.into(),
            PropertyValue::List(metamodel.depends_on.iter().cloned().map(Into::into).collect()),
        );
        let mm_node = self.backend.create_node(labels::METAMODEL, properties).await?;
        self.backend
            .index_add(
                indexes::METAMODELS,
                mm_node.into(),
                indexes::URI_FIELD,
                metamodel.uri.clone().into(),
            )
            .await?;

        for type_def in &metamodel.types {
            let mut properties = Properties::new();
            properties.insert(props::NAME.into(), type_def.name.clone().into());
            properties.insert(props::METAMODEL.into(), metamodel.uri.clone().into());
            properties.insert(
                props::SUPERTYPES.into(),
                PropertyValue::List(type_def.supertypes.iter().cloned().map(Into::into).collect()),
            );
            properties.insert(props::SINGLETON.into(), type_def.singleton.into());
            properties.insert(
                props::FEATURES.into(),
                PropertyValue::Json(serde_json::to_value(&type_def.features)?),
            );
            let type_node = self.backend.create_node(labels::TYPE, properties).await?;
            self.backend
                .create_edge(type_node, mm_node, edges::METAMODEL, Properties::new())
                .await?;
            self.backend
                .index_add(
                    indexes::TYPES,
                    type_node.into(),
                    &metamodel.uri,
                    type_def.name.clone().into(),
                )
                .await?;
        }
        Ok(())
    }

    /// `uris` plus every registered metamodel that (transitively) depends on
    /// one of them.
    pub async fn dependents_closure(&self, uris: &[String]) -> Result<Vec<String>> {
        let registered = self.registered().await?;
        let mut dependencies = Vec::with_capacity(registered.len());
        for uri in &registered {
            dependencies.push((uri.clone(), self.depends_on(uri).await?));
        }

        let mut closure: BTreeSet<String> = uris
            .iter()
            .filter(|u| registered.contains(u))
            .cloned()
            .collect();
        loop {
            let before = closure.len();
            for (uri, deps) in &dependencies {
                if deps.iter().any(|d| closure.contains(d)) {
                    closure.insert(uri.clone());
                }
            }
            if closure.len() == before {
                break;
            }
        }
        Ok(closure.into_iter().collect())
    }

    async fn depends_on(&self, uri: &str) -> Result<Vec<String>> {
        let Some(node) = self.metamodel_node(uri).await? else {
            return Ok(Vec::new());
        };
        Ok(match self.backend.get_property(node, props::DEPENDS_ON).await? {
            Some(PropertyValue::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Delete the metamodel node and its type nodes. Instances must already
    /// be gone; a type node with remaining instances is a storage
    /// inconsistency.
    pub async fn remove(&self, uri: &str) -> Result<()> {
        for type_node in self.type_nodes(uri).await? {
            for edge in self
                .backend
                .edges(type_node, Direction::Outgoing, Some(edges::METAMODEL))
                .await?
            {
                self.backend.delete_edge(edge.id).await?;
            }
            if !self.backend.delete_node(type_node).await? {
                bail!(IndexError::StorageInconsistency(format!(
                    "type node {} of {} still has instances",
                    type_node, uri
                )));
            }
        }
        if let Some(node) = self.metamodel_node(uri).await? {
            if !self.backend.delete_node(node).await? {
                bail!(IndexError::StorageInconsistency(format!(
                    "metamodel node for {} still has edges",
                    uri
                )));
            }
        }
        info!(uri = %uri, "Unregistered metamodel");
        Ok(())
    }

    /// Features declared directly on a type node.
    pub async fn features(&self, type_node: NodeId) -> Result<Vec<FeatureDef>> {
        match self.backend.get_property(type_node, props::FEATURES).await? {
            Some(PropertyValue::Json(value)) => serde_json::from_value(value)
                .with_context(|| format!("Corrupt feature list on type node {}", type_node)),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn set_features(&self, type_node: NodeId, features: &[FeatureDef]) -> Result<()> {
        self.backend
            .set_property(
                type_node,
                props::FEATURES,
                PropertyValue::Json(serde_json::to_value(features)?),
            )
            .await
    }

    /// Names of the attributes with a per-type index.
    pub async fn indexed_attributes(&self, type_node: NodeId) -> Result<BTreeSet<String>> {
        Ok(match self.backend.get_property(type_node, props::INDEXED).await? {
            Some(PropertyValue::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => BTreeSet::new(),
        })
    }

    pub async fn set_indexed_attributes(
        &self,
        type_node: NodeId,
        attributes: &BTreeSet<String>,
    ) -> Result<()> {
        self.backend
            .set_property(
                type_node,
                props::INDEXED,
                PropertyValue::List(attributes.iter().cloned().map(Into::into).collect()),
            )
            .await
    }

    /// The type node and every type that lists it as a (transitive)
    /// supertype within the same metamodel.
    pub async fn with_subtypes(&self, metamodel: &str, name: &str) -> Result<Vec<NodeId>> {
        let mut names: BTreeSet<String> = BTreeSet::from([name.to_string()]);
        let mut candidates = Vec::new();
        for node in self.type_nodes(metamodel).await? {
            let type_name = self.backend.string_property(node, props::NAME).await?;
            let supertypes = match self.backend.get_property(node, props::SUPERTYPES).await? {
                Some(PropertyValue::List(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            };
            candidates.push((node, type_name.unwrap_or_default(), supertypes));
        }
        loop {
            let before = names.len();
            for (_, type_name, supertypes) in &candidates {
                if supertypes.iter().any(|s| names.contains(s)) {
                    names.insert(type_name.clone());
                }
            }
            if names.len() == before {
                break;
            }
        }
        Ok(candidates
            .into_iter()
            .filter(|(_, type_name, _)| names.contains(type_name))
            .map(|(node, _, _)| node)
            .collect())
    }

    /// Element nodes whose instance-of edge points at `type_node`.
    pub async fn instances(&self, type_node: NodeId) -> Result<Vec<NodeId>> {
        Ok(self
            .backend
            .edges(type_node, Direction::Incoming, Some(edges::OF_TYPE))
            .await?
            .into_iter()
            .map(|e| e.start)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InMemoryBackend;
    use crate::test_helpers::sample_metamodel;

    async fn registry() -> (Arc<InMemoryBackend>, MetamodelRegistry) {
        let backend = Arc::new(InMemoryBackend::new());
        let registry = MetamodelRegistry::new(backend.clone());
        (backend, registry)
    }

    #[test]
    fn test_feature_json_shape() {
        let json = r#"[
            {"kind": "attribute", "name": "name"},
            {"kind": "reference", "name": "parts", "many": true, "containment": true},
            {"kind": "derived", "name": "label", "language": "attr", "expression": "name"}
        ]"#;
        let features: Vec<FeatureDef> = serde_json::from_str(json).unwrap();
        assert_eq!(features.len(), 3);
        assert!(matches!(&features[1], FeatureDef::Reference(r) if r.containment && !r.container));
        assert_eq!(features[2].name(), "label");
    }

    #[tokio::test]
    async fn test_register_creates_type_nodes() {
        let (backend, registry) = registry().await;
        backend.begin_transaction().await.unwrap();
        let added = registry.register(&[sample_metamodel()]).await.unwrap();
        backend.commit().await.unwrap();

        assert_eq!(added, vec![crate::test_helpers::ARCH_URI.to_string()]);
        let component = registry
            .type_node(crate::test_helpers::ARCH_URI, "Component")
            .await
            .unwrap()
            .expect("type node");
        let features = registry.features(component).await.unwrap();
        assert!(features.iter().any(|f| f.name() == "name"));

        // a second registration is a no-op
        backend.begin_transaction().await.unwrap();
        assert!(registry.register(&[sample_metamodel()]).await.unwrap().is_empty());
        backend.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_requires_dependencies() {
        let (backend, registry) = registry().await;
        let dependent = Metamodel {
            uri: "urn:ext".into(),
            depends_on: vec!["urn:missing".into()],
            types: Vec::new(),
        };
        backend.begin_transaction().await.unwrap();
        let err = registry.register(&[dependent]).await.unwrap_err();
        backend.rollback().await.unwrap();
        assert!(matches!(
            crate::error::classify(&err),
            Some(IndexError::MetamodelNotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_dependents_closure_and_remove() {
        let (backend, registry) = registry().await;
        let base = sample_metamodel();
        let ext = Metamodel {
            uri: "urn:ext".into(),
            depends_on: vec![base.uri.clone()],
            types: vec![TypeDef {
                name: "Plugin".into(),
                supertypes: Vec::new(),
                features: Vec::new(),
                singleton: false,
            }],
        };
        backend.begin_transaction().await.unwrap();
        registry.register(&[base.clone(), ext]).await.unwrap();
        let closure = registry
            .dependents_closure(&[base.uri.clone()])
            .await
            .unwrap();
        assert_eq!(closure, vec![base.uri.clone(), "urn:ext".to_string()]);

        registry.remove("urn:ext").await.unwrap();
        backend.commit().await.unwrap();
        assert!(!registry.is_registered("urn:ext").await.unwrap());
        assert!(registry.is_registered(&base.uri).await.unwrap());
    }

    #[tokio::test]
    async fn test_subtypes_are_found() {
        let (backend, registry) = registry().await;
        backend.begin_transaction().await.unwrap();
        registry.register(&[sample_metamodel()]).await.unwrap();
        backend.commit().await.unwrap();

        let nodes = registry
            .with_subtypes(crate::test_helpers::ARCH_URI, "Named")
            .await
            .unwrap();
        // Named, Component and Connector
        assert_eq!(nodes.len(), 3);
    }
}
