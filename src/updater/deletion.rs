//! Subgraph deletion
//!
//! Removing an artifact walks its elements through the incoming `_file`
//! edges of its file node. Elements still held by another file only lose
//! the edge to this one. The others are dereferenced, incoming references
//! from surviving elements are turned into proxy markers, and the now
//! edge-less nodes are deleted. Traversal works on identity sets, never by
//! recursion, so cyclic containment is harmless.

use super::proxy::ProxyRef;
use super::GraphUpdater;
use crate::error::IndexError;
use crate::events::GraphChange;
use crate::graph::backend::GraphBackendExt;
use crate::graph::model::{edges, indexes, is_reserved_label, props, Direction, NodeId};
use crate::model::element::file_key;
use anyhow::{bail, Result};
use std::collections::BTreeSet;
use tracing::debug;

impl GraphUpdater {
    /// Delete the artifact at `path` if it is indexed. Returns whether a
    /// file node was removed.
    pub async fn delete_path(&self, repository: &str, path: &str) -> Result<bool> {
        match self.file_node(repository, path).await? {
            Some(file) => {
                self.delete_file(file).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete a file node together with every element only it contains.
    pub async fn delete_file(&self, file: NodeId) -> Result<()> {
        let Some(node) = self.backend.get_node(file).await? else {
            return Ok(());
        };
        let repository = node.string_property(props::REPOSITORY).unwrap_or_default().to_string();
        let path = node.string_property(props::PATH).unwrap_or_default().to_string();
        let key = file_key(&repository, &path);

        let elements: Vec<NodeId> = self
            .backend
            .edges(file, Direction::Incoming, Some(edges::FILE))
            .await?
            .into_iter()
            .map(|e| e.start)
            .collect();
        let count = elements.len();
        self.release_elements(file, &key, elements).await?;

        if !self.backend.delete_node(file).await? {
            bail!(IndexError::StorageInconsistency(format!(
                "file node {} for {} still has edges",
                file, key
            )));
        }
        self.emit(GraphChange::FileRemoved {
            file,
            repository: repository.clone(),
            path: path.clone(),
        })?;
        debug!(repository = %repository, path = %path, elements = count, "Deleted artifact subgraph");
        Ok(())
    }

    /// Detach `elements` from `file`. Elements also held by another file
    /// keep living; the rest are deleted.
    pub(crate) async fn release_elements(
        &self,
        file: NodeId,
        key: &str,
        elements: Vec<NodeId>,
    ) -> Result<()> {
        let mut doomed = BTreeSet::new();
        for element in elements {
            let file_edges = self
                .backend
                .edges(element, Direction::Outgoing, Some(edges::FILE))
                .await?;
            let held_elsewhere = file_edges.iter().any(|e| e.end != file);
            if held_elsewhere {
                for edge in file_edges.iter().filter(|e| e.end == file) {
                    self.backend.delete_edge(edge.id).await?;
                }
                self.backend
                    .index_remove(indexes::FRAGMENTS, element.into(), Some(key), None)
                    .await?;
            } else {
                doomed.insert(element);
            }
        }
        if !doomed.is_empty() {
            self.delete_elements(key, &doomed).await?;
        }
        Ok(())
    }

    async fn delete_elements(&self, key: &str, doomed: &BTreeSet<NodeId>) -> Result<()> {
        for &element in doomed {
            self.dereference(element).await?;
        }

        // Whatever still points at a doomed element comes from outside the set.
        for &element in doomed {
            let fragment = self
                .backend
                .string_property(element, props::ID)
                .await?
                .unwrap_or_default();
            for edge in self
                .backend
                .edges(element, Direction::Incoming, None)
                .await?
            {
                if !is_reserved_label(&edge.label) {
                    self.add_proxy(
                        edge.start,
                        key,
                        ProxyRef {
                            fragment: fragment.clone(),
                            label: edge.label.clone(),
                            containment: edge.flag(props::CONTAINMENT),
                            container: edge.flag(props::CONTAINER),
                        },
                    )
                    .await?;
                }
                self.backend.delete_edge(edge.id).await?;
                self.emit(GraphChange::ReferenceRemoved {
                    source: edge.start,
                    target: element,
                    label: edge.label.clone(),
                    transient: false,
                })?;
            }
        }

        for &element in doomed {
            if !self.backend.delete_node(element).await? {
                bail!(IndexError::StorageInconsistency(format!(
                    "element {} still has edges after dereferencing",
                    element
                )));
            }
            self.emit(GraphChange::ElementRemoved {
                element,
                transient: false,
            })?;
        }
        Ok(())
    }

    /// Drop every outgoing edge of `element`, deleting attached derived
    /// attribute nodes, plus its proxy markers.
    async fn dereference(&self, element: NodeId) -> Result<()> {
        for edge in self
            .backend
            .edges(element, Direction::Outgoing, None)
            .await?
        {
            self.backend.delete_edge(edge.id).await?;
            if edge.flag(props::IS_DERIVED) {
                if !self.backend.delete_node(edge.end).await? {
                    bail!(IndexError::StorageInconsistency(format!(
                        "derived attribute node {} of element {} still has edges",
                        edge.end, element
                    )));
                }
                self.emit(GraphChange::AttributeRemoved {
                    element,
                    attribute: edge.label.clone(),
                    transient: false,
                })?;
                continue;
            }
            if !is_reserved_label(&edge.label) {
                self.emit(GraphChange::ReferenceRemoved {
                    source: element,
                    target: edge.end,
                    label: edge.label.clone(),
                    transient: false,
                })?;
            }
        }
        self.clear_proxies(element).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::backend::GraphBackend;
    use crate::graph::model::{labels, Direction};
    use crate::model::{ElementRef, ElementTree};
    use crate::test_helpers::{component, indexed_updater, library};

    #[tokio::test]
    async fn test_delete_converts_incoming_references_to_markers() {
        let (backend, updater) = indexed_updater().await;
        let a = ElementTree {
            elements: vec![component("x", "X")],
        };
        let b = ElementTree {
            elements: vec![component("y", "Y").with_reference("uses", ElementRef::in_file("a.model.json", "x"))],
        };
        backend.begin_transaction().await.unwrap();
        updater.update_file("repo", "a.model.json", "r1", Some(&a)).await.unwrap();
        updater.update_file("repo", "b.model.json", "r1", Some(&b)).await.unwrap();
        let y = updater.lookup_fragment("repo::b.model.json", "y").await.unwrap().unwrap();
        assert_eq!(backend.edges(y, Direction::Outgoing, Some("uses")).await.unwrap().len(), 1);

        assert!(updater.delete_path("repo", "a.model.json").await.unwrap());
        backend.commit().await.unwrap();

        assert!(backend.edges(y, Direction::Outgoing, Some("uses")).await.unwrap().is_empty());
        let markers = updater.proxy_markers(y).await.unwrap();
        let marker = &markers["repo::a.model.json"][0];
        assert_eq!(marker.fragment, "x");
        assert_eq!(marker.label, "uses");
        assert!(!marker.containment);
        assert!(updater.file_node("repo", "a.model.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shared_singleton_survives_until_last_file() {
        let (backend, updater) = indexed_updater().await;
        let tree = ElementTree {
            elements: vec![library("std", "Standard")],
        };
        backend.begin_transaction().await.unwrap();
        updater.update_file("repo", "a.model.json", "r1", Some(&tree)).await.unwrap();
        updater.update_file("repo", "b.model.json", "r1", Some(&tree)).await.unwrap();
        assert_eq!(backend.nodes_by_label(labels::ELEMENT).await.unwrap().len(), 1);

        updater.delete_path("repo", "a.model.json").await.unwrap();
        assert_eq!(backend.nodes_by_label(labels::ELEMENT).await.unwrap().len(), 1);
        assert!(updater
            .lookup_fragment("repo::b.model.json", "std")
            .await
            .unwrap()
            .is_some());

        updater.delete_path("repo", "b.model.json").await.unwrap();
        backend.commit().await.unwrap();
        assert!(backend.nodes_by_label(labels::ELEMENT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cyclic_containment_is_deleted() {
        let (backend, updater) = indexed_updater().await;
        let tree = ElementTree {
            elements: vec![
                component("a", "A").with_reference("parts", ElementRef::local("b")),
                component("b", "B").with_reference("parts", ElementRef::local("a")),
            ],
        };
        backend.begin_transaction().await.unwrap();
        updater.update_file("repo", "c.model.json", "r1", Some(&tree)).await.unwrap();
        updater.delete_path("repo", "c.model.json").await.unwrap();
        backend.commit().await.unwrap();

        assert!(backend.nodes_by_label(labels::ELEMENT).await.unwrap().is_empty());
        assert!(backend.nodes_by_label(labels::FILE).await.unwrap().is_empty());
        // only type -> metamodel edges remain
        let type_edges = backend.edge_count().await.unwrap();
        assert_eq!(type_edges, backend.nodes_by_label(labels::TYPE).await.unwrap().len());
    }

    #[tokio::test]
    async fn test_delete_unknown_path_is_noop() {
        let (backend, updater) = indexed_updater().await;
        backend.begin_transaction().await.unwrap();
        assert!(!updater.delete_path("repo", "missing.model.json").await.unwrap());
        backend.commit().await.unwrap();
    }
}
