//! Graph model updater
//!
//! Translates a parsed artifact into node and edge mutations against the
//! backend. The caller owns the write context: one artifact's update always
//! runs inside one transaction or one batch window.
//!
//! ## Modules
//!
//! - [`types`]: per-cycle type lookup cache
//! - [`deletion`]: subgraph removal for deleted or broken artifacts
//! - [`proxy`]: markers for cross-artifact references with absent targets

pub mod deletion;
pub mod proxy;
pub mod types;

pub use proxy::ProxyRef;
pub use types::{TypeCache, TypeInfo};

use crate::derived;
use crate::error::IndexError;
use crate::events::{CompositeListener, GraphChange};
use crate::graph::backend::{GraphBackend, GraphBackendExt};
use crate::graph::model::{edges, indexes, labels, props, Direction, NodeId, Properties, PropertyValue};
use crate::index::IndexQuery;
use crate::model::element::{file_key, ElementTree, ParsedElement, TypeRef};
use anyhow::{bail, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Counts of what one artifact update did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub proxies: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(UpdateStats),
    /// The artifact did not parse; its previous subgraph was removed.
    ParseFailed,
}

pub struct GraphUpdater {
    backend: Arc<dyn GraphBackend>,
    listeners: Arc<CompositeListener>,
    types: TypeCache,
}

impl GraphUpdater {
    pub fn new(backend: Arc<dyn GraphBackend>, listeners: Arc<CompositeListener>) -> Self {
        Self {
            types: TypeCache::new(backend.clone()),
            backend,
            listeners,
        }
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    pub fn types(&self) -> &TypeCache {
        &self.types
    }

    /// Forget cached types; called at the start of every cycle and after
    /// the type system changes.
    pub fn clear_type_cache(&self) {
        self.types.clear();
    }

    pub(crate) fn emit(&self, change: GraphChange) -> Result<()> {
        self.listeners.notify(&change)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub async fn file_node(&self, repository: &str, path: &str) -> Result<Option<NodeId>> {
        self.backend.index_lookup(indexes::FILES, repository, path).await
    }

    pub async fn file_node_by_key(&self, key: &str) -> Result<Option<NodeId>> {
        self.backend
            .index_lookup(indexes::FILE_KEYS, indexes::KEY_FIELD, key)
            .await
    }

    /// Indexed artifacts of a repository as `(path, file node)` pairs.
    pub async fn indexed_files(&self, repository: &str) -> Result<Vec<(String, NodeId)>> {
        let mut files = Vec::new();
        for node in self
            .backend
            .index_nodes(indexes::FILES, repository, &IndexQuery::all())
            .await?
        {
            if let Some(path) = self.backend.string_property(node, props::PATH).await? {
                files.push((path, node));
            }
        }
        Ok(files)
    }

    pub async fn file_revision(&self, file: NodeId) -> Result<Option<String>> {
        self.backend.string_property(file, props::REVISION).await
    }

    pub async fn lookup_fragment(&self, file_key: &str, fragment: &str) -> Result<Option<NodeId>> {
        self.backend
            .index_lookup(indexes::FRAGMENTS, file_key, fragment)
            .await
    }

    /// Elements of a file keyed by fragment id.
    pub async fn fragments(&self, file_key: &str) -> Result<HashMap<String, NodeId>> {
        let mut fragments = HashMap::new();
        for node in self
            .backend
            .index_nodes(indexes::FRAGMENTS, file_key, &IndexQuery::all())
            .await?
        {
            if let Some(id) = self.backend.string_property(node, props::ID).await? {
                fragments.insert(id, node);
            }
        }
        Ok(fragments)
    }

    async fn type_node_of(&self, element: NodeId) -> Result<Option<NodeId>> {
        Ok(self
            .backend
            .edges(element, Direction::Outgoing, Some(edges::OF_TYPE))
            .await?
            .first()
            .map(|e| e.end))
    }

    // ========================================================================
    // Update
    // ========================================================================

    /// Bring the subgraph of one artifact in line with its freshly parsed
    /// tree. `None` means the artifact failed to parse: its previous subgraph
    /// is deleted and `ParseFailed` is returned.
    pub async fn update_file(
        &self,
        repository: &str,
        path: &str,
        revision: &str,
        tree: Option<&ElementTree>,
    ) -> Result<UpdateOutcome> {
        let Some(tree) = tree else {
            if let Some(file) = self.file_node(repository, path).await? {
                self.delete_file(file).await?;
            }
            return Ok(UpdateOutcome::ParseFailed);
        };

        // Every type must resolve before anything is written.
        let mut types: HashMap<TypeRef, Arc<TypeInfo>> = HashMap::new();
        let mut seen = BTreeSet::new();
        for element in &tree.elements {
            if !seen.insert(element.id.as_str()) {
                bail!(IndexError::ParseFailure {
                    path: path.to_string(),
                    reason: format!("duplicate fragment id {}", element.id),
                });
            }
            if !types.contains_key(&element.type_ref) {
                let info = self.types.resolve(&element.type_ref).await?;
                types.insert(element.type_ref.clone(), info);
            }
        }

        let key = file_key(repository, path);
        let file = match self.file_node(repository, path).await? {
            Some(file) => file,
            None => self.create_file(repository, path, revision).await?,
        };
        let existing = self.fragments(&key).await?;
        let mut stats = UpdateStats::default();

        // Pass 1: nodes and attributes.
        let mut nodes: HashMap<String, NodeId> = HashMap::with_capacity(tree.elements.len());
        for element in &tree.elements {
            let info = &types[&element.type_ref];
            let reusable = match existing.get(&element.id) {
                Some(&node) => self.type_node_of(node).await? == Some(info.node),
                None => false,
            };
            let node = match existing.get(&element.id) {
                Some(&node) if reusable => {
                    stats.updated += 1;
                    node
                }
                Some(&node) => {
                    debug!(path = %path, fragment = %element.id, "Element changed type, recreating");
                    self.release_elements(file, &key, vec![node]).await?;
                    stats.added += 1;
                    self.create_element(file, &key, element, info).await?
                }
                None => {
                    stats.added += 1;
                    self.create_element(file, &key, element, info).await?
                }
            };
            self.apply_attributes(node, element, info, path).await?;
            nodes.insert(element.id.clone(), node);
        }

        // Pass 2: references, now that every local target exists.
        for element in &tree.elements {
            let info = &types[&element.type_ref];
            stats.proxies += self
                .apply_references(nodes[&element.id], element, info, repository, path, &nodes)
                .await?;
        }

        let removed: Vec<NodeId> = existing
            .iter()
            .filter(|(fragment, _)| !nodes.contains_key(*fragment))
            .map(|(_, node)| *node)
            .collect();
        stats.removed = removed.len();
        if !removed.is_empty() {
            self.release_elements(file, &key, removed).await?;
        }

        self.backend
            .set_property(file, props::REVISION, revision.into())
            .await?;
        debug!(
            repository = %repository,
            path = %path,
            added = stats.added,
            updated = stats.updated,
            removed = stats.removed,
            proxies = stats.proxies,
            "Updated artifact"
        );
        Ok(UpdateOutcome::Updated(stats))
    }

    async fn create_file(&self, repository: &str, path: &str, revision: &str) -> Result<NodeId> {
        let mut properties = Properties::new();
        properties.insert(props::PATH.into(), path.into());
        properties.insert(props::REPOSITORY.into(), repository.into());
        properties.insert(props::REVISION.into(), revision.into());
        let file = self.backend.create_node(labels::FILE, properties).await?;
        self.backend
            .index_add(indexes::FILES, file.into(), repository, path.into())
            .await?;
        self.backend
            .index_add(
                indexes::FILE_KEYS,
                file.into(),
                indexes::KEY_FIELD,
                file_key(repository, path).into(),
            )
            .await?;
        self.emit(GraphChange::FileAdded {
            file,
            repository: repository.to_string(),
            path: path.to_string(),
        })?;
        Ok(file)
    }

    async fn create_element(
        &self,
        file: NodeId,
        key: &str,
        element: &ParsedElement,
        info: &TypeInfo,
    ) -> Result<NodeId> {
        if info.singleton {
            if let Some(shared) = self
                .backend
                .index_lookup(indexes::SINGLETONS, &info.singleton_key(), &element.id)
                .await?
            {
                self.backend
                    .create_edge(shared, file, edges::FILE, Properties::new())
                    .await?;
                self.backend
                    .index_add(indexes::FRAGMENTS, shared.into(), key, element.id.clone().into())
                    .await?;
                return Ok(shared);
            }
        }

        let mut properties = Properties::new();
        properties.insert(props::ID.into(), element.id.clone().into());
        let node = self.backend.create_node(labels::ELEMENT, properties).await?;
        self.backend
            .create_edge(node, info.node, edges::OF_TYPE, Properties::new())
            .await?;
        self.backend
            .create_edge(node, file, edges::FILE, Properties::new())
            .await?;
        self.backend
            .index_add(indexes::FRAGMENTS, node.into(), key, element.id.clone().into())
            .await?;
        if info.singleton {
            self.backend
                .index_add(
                    indexes::SINGLETONS,
                    node.into(),
                    &info.singleton_key(),
                    element.id.clone().into(),
                )
                .await?;
        }
        self.emit(GraphChange::ElementAdded {
            element: node,
            type_name: info.type_ref.name.clone(),
            transient: false,
        })?;

        for def in info.derived.values() {
            derived::attach(self.backend.as_ref(), node, def).await?;
        }
        Ok(node)
    }

    /// Set declared attributes, unsetting those the new version omits.
    async fn apply_attributes(
        &self,
        node: NodeId,
        element: &ParsedElement,
        info: &TypeInfo,
        path: &str,
    ) -> Result<()> {
        let current = self
            .backend
            .get_node(node)
            .await?
            .map(|n| n.properties)
            .unwrap_or_default();

        for name in info.attributes.keys() {
            let index = info
                .indexed
                .contains(name)
                .then(|| indexes::attribute_index(&info.type_ref.metamodel, &info.type_ref.name, name));
            match (current.get(name), element.attributes.get(name)) {
                (old, Some(value)) if old != Some(value) => {
                    if !value.is_homogeneous() {
                        bail!(IndexError::ParseFailure {
                            path: path.to_string(),
                            reason: format!("attribute {} of {} mixes value types", name, element.id),
                        });
                    }
                    self.backend.set_property(node, name, value.clone()).await?;
                    if let Some(index) = &index {
                        self.backend
                            .index_remove(index, node.into(), Some(name), None)
                            .await?;
                        self.backend
                            .index_add(index, node.into(), name, value.clone())
                            .await?;
                    }
                    self.emit(GraphChange::AttributeUpdated {
                        element: node,
                        attribute: name.clone(),
                        value: value.clone(),
                        transient: false,
                    })?;
                }
                (Some(_), None) => {
                    self.backend.remove_property(node, name).await?;
                    if let Some(index) = &index {
                        self.backend
                            .index_remove(index, node.into(), Some(name), None)
                            .await?;
                    }
                    self.emit(GraphChange::AttributeRemoved {
                        element: node,
                        attribute: name.clone(),
                        transient: false,
                    })?;
                }
                _ => {}
            }
        }

        for name in element.attributes.keys() {
            if !info.attributes.contains_key(name) {
                debug!(fragment = %element.id, attribute = %name, "Ignoring undeclared attribute");
            }
        }
        Ok(())
    }

    /// Materialize references as edges where the target is indexed and as
    /// proxy markers otherwise. Returns the number of markers written.
    async fn apply_references(
        &self,
        node: NodeId,
        element: &ParsedElement,
        info: &TypeInfo,
        repository: &str,
        path: &str,
        local: &HashMap<String, NodeId>,
    ) -> Result<usize> {
        let own_key = file_key(repository, path);
        let mut proxies = 0;

        for (name, def) in &info.references {
            let mut live = Vec::new();
            let mut unresolved = Vec::new();
            for target in element.references.get(name).map(Vec::as_slice).unwrap_or(&[]) {
                let target_key = target.file_key(repository, path);
                let resolved = if target_key == own_key {
                    local.get(&target.fragment).copied()
                } else {
                    self.lookup_fragment(&target_key, &target.fragment).await?
                };
                match resolved {
                    Some(target_node) => live.push(target_node),
                    None => unresolved.push((
                        target_key,
                        ProxyRef {
                            fragment: target.fragment.clone(),
                            label: name.clone(),
                            containment: def.containment,
                            container: def.container,
                        },
                    )),
                }
            }

            // Keep edges still wanted, drop the rest.
            for edge in self
                .backend
                .edges(node, Direction::Outgoing, Some(name))
                .await?
            {
                if edge.flag(props::IS_DERIVED) {
                    continue;
                }
                if let Some(pos) = live.iter().position(|t| *t == edge.end) {
                    live.swap_remove(pos);
                    continue;
                }
                self.backend.delete_edge(edge.id).await?;
                self.emit(GraphChange::ReferenceRemoved {
                    source: node,
                    target: edge.end,
                    label: name.clone(),
                    transient: false,
                })?;
            }
            for target in live {
                self.backend
                    .create_edge(
                        node,
                        target,
                        name,
                        proxy::reference_properties(def.containment, def.container),
                    )
                    .await?;
                self.emit(GraphChange::ReferenceAdded {
                    source: node,
                    target,
                    label: name.clone(),
                    transient: false,
                })?;
            }

            proxies += unresolved.len();
            self.replace_proxies(node, name, unresolved).await?;
        }

        for name in element.references.keys() {
            if !info.references.contains_key(name) {
                debug!(fragment = %element.id, reference = %name, "Ignoring undeclared reference");
            }
        }
        Ok(proxies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ElementRef;
    use crate::test_helpers::{arch_element, component, indexed_updater, ARCH_URI};

    fn unwrap_stats(outcome: UpdateOutcome) -> UpdateStats {
        match outcome {
            UpdateOutcome::Updated(stats) => stats,
            UpdateOutcome::ParseFailed => panic!("unexpected parse failure"),
        }
    }

    #[tokio::test]
    async fn test_new_file_creates_elements_and_edges() {
        let (backend, updater) = indexed_updater().await;
        let tree = ElementTree {
            elements: vec![
                component("root", "Root")
                    .with_reference("parts", ElementRef::local("child"))
                    .with_attribute("size", 3i64),
                component("child", "Child"),
            ],
        };
        backend.begin_transaction().await.unwrap();
        let stats = unwrap_stats(
            updater
                .update_file("repo", "a.model.json", "r1", Some(&tree))
                .await
                .unwrap(),
        );
        backend.commit().await.unwrap();
        assert_eq!(stats.added, 2);
        assert_eq!(stats.proxies, 0);

        let file = updater.file_node("repo", "a.model.json").await.unwrap().unwrap();
        assert_eq!(updater.file_revision(file).await.unwrap().as_deref(), Some("r1"));
        let root = updater.lookup_fragment("repo::a.model.json", "root").await.unwrap().unwrap();
        let child = updater.lookup_fragment("repo::a.model.json", "child").await.unwrap().unwrap();

        let parts = backend.edges(root, Direction::Outgoing, Some("parts")).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].end, child);
        assert!(parts[0].flag(props::CONTAINMENT));
        assert_eq!(
            backend.get_property(root, "size").await.unwrap(),
            Some(PropertyValue::Int(3))
        );
        assert_eq!(
            backend.edges(file, Direction::Incoming, Some(edges::FILE)).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_update_reuses_nodes_and_unsets_attributes() {
        let (backend, updater) = indexed_updater().await;
        let v1 = ElementTree {
            elements: vec![component("a", "A").with_attribute("size", 1i64)],
        };
        let v2 = ElementTree {
            elements: vec![component("a", "A2")],
        };
        backend.begin_transaction().await.unwrap();
        updater.update_file("repo", "a.model.json", "r1", Some(&v1)).await.unwrap();
        let before = updater.lookup_fragment("repo::a.model.json", "a").await.unwrap();
        let stats = unwrap_stats(
            updater
                .update_file("repo", "a.model.json", "r2", Some(&v2))
                .await
                .unwrap(),
        );
        backend.commit().await.unwrap();

        let after = updater.lookup_fragment("repo::a.model.json", "a").await.unwrap();
        assert_eq!(before, after);
        assert_eq!(stats.updated, 1);
        let a = after.unwrap();
        assert_eq!(backend.get_property(a, "size").await.unwrap(), None);
        assert_eq!(
            backend.get_property(a, "name").await.unwrap(),
            Some(PropertyValue::from("A2"))
        );
    }

    #[tokio::test]
    async fn test_removed_elements_are_deleted() {
        let (backend, updater) = indexed_updater().await;
        let v1 = ElementTree {
            elements: vec![
                component("a", "A").with_reference("uses", ElementRef::local("b")),
                component("b", "B"),
            ],
        };
        let v2 = ElementTree {
            elements: vec![component("a", "A")],
        };
        backend.begin_transaction().await.unwrap();
        updater.update_file("repo", "a.model.json", "r1", Some(&v1)).await.unwrap();
        let nodes_before = backend.node_count().await.unwrap();
        let stats = unwrap_stats(
            updater
                .update_file("repo", "a.model.json", "r2", Some(&v2))
                .await
                .unwrap(),
        );
        backend.commit().await.unwrap();

        assert_eq!(stats.removed, 1);
        assert_eq!(backend.node_count().await.unwrap(), nodes_before - 1);
        assert!(updater
            .lookup_fragment("repo::a.model.json", "b")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unregistered_metamodel_is_refused() {
        let (backend, updater) = indexed_updater().await;
        let tree = ElementTree {
            elements: vec![ParsedElement::new("x", TypeRef::new("urn:unknown", "Thing"))],
        };
        backend.begin_transaction().await.unwrap();
        let err = updater
            .update_file("repo", "x.model.json", "r1", Some(&tree))
            .await
            .unwrap_err();
        backend.rollback().await.unwrap();

        assert!(matches!(
            crate::error::classify(&err),
            Some(IndexError::MetamodelNotRegistered { uri }) if uri == "urn:unknown"
        ));
        assert!(updater.file_node("repo", "x.model.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parse_failure_removes_previous_subgraph() {
        let (backend, updater) = indexed_updater().await;
        let tree = ElementTree {
            elements: vec![component("a", "A")],
        };
        backend.begin_transaction().await.unwrap();
        updater.update_file("repo", "a.model.json", "r1", Some(&tree)).await.unwrap();
        let outcome = updater
            .update_file("repo", "a.model.json", "r2", None)
            .await
            .unwrap();
        backend.commit().await.unwrap();

        assert_eq!(outcome, UpdateOutcome::ParseFailed);
        assert!(updater.file_node("repo", "a.model.json").await.unwrap().is_none());
        assert!(backend.nodes_by_label(labels::ELEMENT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_fragments_are_a_parse_failure() {
        let (backend, updater) = indexed_updater().await;
        let tree = ElementTree {
            elements: vec![component("a", "A"), arch_element("a", "Connector")],
        };
        backend.begin_transaction().await.unwrap();
        let err = updater
            .update_file("repo", "a.model.json", "r1", Some(&tree))
            .await
            .unwrap_err();
        backend.rollback().await.unwrap();
        assert!(matches!(
            crate::error::classify(&err),
            Some(IndexError::ParseFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_indexed_attribute_is_maintained() {
        let (backend, updater) = indexed_updater().await;
        let type_node = crate::model::MetamodelRegistry::new(backend.clone())
            .type_node(ARCH_URI, "Component")
            .await
            .unwrap()
            .unwrap();
        backend.begin_transaction().await.unwrap();
        crate::model::MetamodelRegistry::new(backend.clone())
            .set_indexed_attributes(type_node, &BTreeSet::from(["name".to_string()]))
            .await
            .unwrap();
        updater.clear_type_cache();

        let v1 = ElementTree {
            elements: vec![component("a", "Alpha")],
        };
        let v2 = ElementTree {
            elements: vec![component("a", "Beta")],
        };
        updater.update_file("repo", "a.model.json", "r1", Some(&v1)).await.unwrap();
        updater.update_file("repo", "a.model.json", "r2", Some(&v2)).await.unwrap();
        backend.commit().await.unwrap();

        let index = indexes::attribute_index(ARCH_URI, "Component", "name");
        assert!(backend
            .index_query(&index, "name", &IndexQuery::parse("Alp*"))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            backend
                .index_query(&index, "name", &IndexQuery::parse("*eta"))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
