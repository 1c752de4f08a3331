//! Per-cycle type lookup cache
//!
//! Resolving a type means finding its node through the type index, reading
//! the declared features of the type and of its supertypes, and splitting
//! them by kind. The result is cached for the duration of one
//! synchronization cycle.

use crate::error::IndexError;
use crate::graph::backend::{GraphBackend, GraphBackendExt};
use crate::graph::model::{edges, props, Direction, NodeId, PropertyValue};
use crate::model::element::TypeRef;
use crate::model::metamodel::{AttributeDef, DerivedDef, FeatureDef, MetamodelRegistry, ReferenceDef};
use anyhow::{bail, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

const CACHE_CAPACITY: usize = 256;

/// A resolved type: its node plus every feature, inherited ones included.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub node: NodeId,
    pub type_ref: TypeRef,
    pub singleton: bool,
    pub attributes: BTreeMap<String, AttributeDef>,
    pub references: BTreeMap<String, ReferenceDef>,
    pub derived: BTreeMap<String, DerivedDef>,
    /// Attributes with a per-type index.
    pub indexed: BTreeSet<String>,
}

impl TypeInfo {
    pub fn singleton_key(&self) -> String {
        format!("{}#{}", self.type_ref.metamodel, self.type_ref.name)
    }

    fn absorb(&mut self, features: Vec<FeatureDef>) {
        for feature in features {
            match feature {
                FeatureDef::Attribute(a) => {
                    self.attributes.entry(a.name.clone()).or_insert(a);
                }
                FeatureDef::Reference(r) => {
                    self.references.entry(r.name.clone()).or_insert(r);
                }
                FeatureDef::Derived(d) => {
                    self.derived.entry(d.name.clone()).or_insert(d);
                }
            }
        }
    }
}

pub struct TypeCache {
    backend: Arc<dyn GraphBackend>,
    registry: MetamodelRegistry,
    entries: Mutex<LruCache<TypeRef, Arc<TypeInfo>>>,
}

impl TypeCache {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry: MetamodelRegistry::new(backend.clone()),
            backend,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub async fn resolve(&self, type_ref: &TypeRef) -> Result<Arc<TypeInfo>> {
        let cached = self.entries.lock().get(type_ref).cloned();
        if let Some(info) = cached {
            return Ok(info);
        }
        let info = Arc::new(self.load(type_ref).await?);
        self.entries.lock().put(type_ref.clone(), info.clone());
        Ok(info)
    }

    async fn load(&self, type_ref: &TypeRef) -> Result<TypeInfo> {
        if !self.registry.is_registered(&type_ref.metamodel).await? {
            bail!(IndexError::MetamodelNotRegistered {
                uri: type_ref.metamodel.clone()
            });
        }
        let Some(node) = self
            .registry
            .type_node(&type_ref.metamodel, &type_ref.name)
            .await?
        else {
            bail!(IndexError::StorageInconsistency(format!(
                "type {} is not declared by {}",
                type_ref.name, type_ref.metamodel
            )));
        };

        let singleton = self
            .backend
            .get_property(node, props::SINGLETON)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let mut info = TypeInfo {
            node,
            type_ref: type_ref.clone(),
            singleton,
            attributes: BTreeMap::new(),
            references: BTreeMap::new(),
            derived: BTreeMap::new(),
            indexed: self.registry.indexed_attributes(node).await?,
        };

        // Own features first so they shadow inherited ones of the same name.
        let mut visited = BTreeSet::new();
        let mut pending = vec![node];
        while let Some(current) = pending.pop() {
            if !visited.insert(current) {
                continue;
            }
            info.absorb(self.registry.features(current).await?);
            if let Some(PropertyValue::List(supertypes)) =
                self.backend.get_property(current, props::SUPERTYPES).await?
            {
                for supertype in supertypes.iter().filter_map(PropertyValue::as_str) {
                    if let Some(super_node) = self
                        .registry
                        .type_node(&type_ref.metamodel, supertype)
                        .await?
                    {
                        pending.push(super_node);
                    }
                }
            }
        }
        Ok(info)
    }

    /// Type of an existing element node, through its instance-of edge.
    pub async fn type_of(&self, element: NodeId) -> Result<Option<Arc<TypeInfo>>> {
        let Some(edge) = self
            .backend
            .edges(element, Direction::Outgoing, Some(edges::OF_TYPE))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let metamodel = self.backend.string_property(edge.end, props::METAMODEL).await?;
        let name = self.backend.string_property(edge.end, props::NAME).await?;
        match (metamodel, name) {
            (Some(metamodel), Some(name)) => {
                Ok(Some(self.resolve(&TypeRef::new(metamodel, name)).await?))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InMemoryBackend;
    use crate::test_helpers::{sample_metamodel, ARCH_URI};

    async fn cache() -> TypeCache {
        let backend = Arc::new(InMemoryBackend::new());
        backend.begin_transaction().await.unwrap();
        MetamodelRegistry::new(backend.clone())
            .register(&[sample_metamodel()])
            .await
            .unwrap();
        backend.commit().await.unwrap();
        TypeCache::new(backend)
    }

    #[tokio::test]
    async fn test_resolve_inherits_supertype_features() {
        let cache = cache().await;
        let info = cache
            .resolve(&TypeRef::new(ARCH_URI, "Component"))
            .await
            .unwrap();
        assert!(info.attributes.contains_key("name"));
        assert!(info.attributes.contains_key("size"));
        assert!(info.references["parts"].containment);
        assert!(!info.singleton);
    }

    #[tokio::test]
    async fn test_unknown_metamodel_is_classified() {
        let cache = cache().await;
        let err = cache
            .resolve(&TypeRef::new("urn:nope", "Component"))
            .await
            .unwrap_err();
        assert!(crate::error::classify(&err)
            .map(|e| e.is_fatal_for_artifact())
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn test_resolve_is_cached() {
        let cache = cache().await;
        let type_ref = TypeRef::new(ARCH_URI, "Library");
        let a = cache.resolve(&type_ref).await.unwrap();
        let b = cache.resolve(&type_ref).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.singleton);

        cache.clear();
        let c = cache.resolve(&type_ref).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
