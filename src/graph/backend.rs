//! GraphBackend trait definition
//!
//! Defines the storage contract every backend implements: transactional
//! node/edge storage with labels and property bags, edge navigation, and the
//! named secondary indexes. The engine only ever talks to `dyn GraphBackend`,
//! so backends are fully swappable.

use super::model::*;
use crate::index::{IndexEntity, IndexQuery};
use anyhow::Result;
use async_trait::async_trait;

/// Which write context a backend is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// No transaction and no batch window; mutations are refused.
    Idle,
    /// A transaction is open; reads see its uncommitted writes.
    Transaction,
    /// Bulk-loading window; writes go straight to the store and cannot be
    /// rolled back.
    Batch,
}

/// Storage contract for the typed property graph.
///
/// Rules every implementation honours:
/// - mutations require an open transaction or batch window;
/// - a batch window cannot be entered while a transaction is open, and no
///   transaction can begin inside a batch window;
/// - an aborted transaction leaves nothing visible to later transactions;
/// - deleting a node that still has edges is refused (`Ok(false)`);
/// - deleting a node drops it from every index.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Short identifier recorded in the instance record (e.g. "memory").
    fn backend_type(&self) -> &'static str;

    // ========================================================================
    // Write contexts
    // ========================================================================

    async fn mode(&self) -> BackendMode;

    async fn begin_transaction(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn enter_batch_mode(&self) -> Result<()>;

    /// Leave the batch window; a transaction can begin immediately after.
    async fn exit_batch_mode(&self) -> Result<()>;

    /// Persist committed state, for backends that have durable storage.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn create_node(&self, label: &str, properties: Properties) -> Result<NodeId>;

    /// Delete a node with no remaining edges. Returns `false` (and changes
    /// nothing) when edges remain or the node does not exist.
    async fn delete_node(&self, id: NodeId) -> Result<bool>;

    async fn get_node(&self, id: NodeId) -> Result<Option<GraphNode>>;

    async fn nodes_by_label(&self, label: &str) -> Result<Vec<NodeId>>;

    async fn get_property(&self, id: NodeId, key: &str) -> Result<Option<PropertyValue>>;

    async fn set_property(&self, id: NodeId, key: &str, value: PropertyValue) -> Result<()>;

    async fn remove_property(&self, id: NodeId, key: &str) -> Result<()>;

    // ========================================================================
    // Edges
    // ========================================================================

    /// Create an edge; both endpoints must exist in the current snapshot.
    async fn create_edge(
        &self,
        start: NodeId,
        end: NodeId,
        label: &str,
        properties: Properties,
    ) -> Result<EdgeId>;

    async fn delete_edge(&self, id: EdgeId) -> Result<()>;

    async fn get_edge(&self, id: EdgeId) -> Result<Option<GraphEdge>>;

    /// Edges touching `node`, optionally filtered by label.
    async fn edges(
        &self,
        node: NodeId,
        direction: Direction,
        label: Option<&str>,
    ) -> Result<Vec<GraphEdge>>;

    // ========================================================================
    // Indexes
    // ========================================================================

    async fn index_add(
        &self,
        index: &str,
        entity: IndexEntity,
        key: &str,
        value: PropertyValue,
    ) -> Result<()>;

    /// Remove bindings of `entity`, optionally restricted to a key and value.
    async fn index_remove(
        &self,
        index: &str,
        entity: IndexEntity,
        key: Option<&str>,
        value: Option<&PropertyValue>,
    ) -> Result<()>;

    /// Query an index; an unknown index yields no hits.
    async fn index_query(
        &self,
        index: &str,
        key: &str,
        query: &IndexQuery,
    ) -> Result<Vec<IndexEntity>>;

    /// Distinct values stored under `key`.
    async fn index_values(&self, index: &str, key: &str) -> Result<Vec<PropertyValue>>;

    async fn index_names(&self) -> Result<Vec<String>>;

    async fn drop_index(&self, index: &str) -> Result<()>;

    // ========================================================================
    // Statistics
    // ========================================================================

    async fn node_count(&self) -> Result<usize>;

    async fn edge_count(&self) -> Result<usize>;
}

/// Convenience queries layered over the raw contract.
#[async_trait]
pub trait GraphBackendExt: GraphBackend {
    /// Node hits of an index query.
    async fn index_nodes(&self, index: &str, key: &str, query: &IndexQuery) -> Result<Vec<NodeId>> {
        Ok(self
            .index_query(index, key, query)
            .await?
            .into_iter()
            .filter_map(IndexEntity::as_node)
            .collect())
    }

    /// First node hit of an exact lookup.
    async fn index_lookup(&self, index: &str, key: &str, value: &str) -> Result<Option<NodeId>> {
        Ok(self
            .index_nodes(index, key, &IndexQuery::Exact(PropertyValue::from(value)))
            .await?
            .into_iter()
            .next())
    }

    async fn string_property(&self, id: NodeId, key: &str) -> Result<Option<String>> {
        Ok(self
            .get_property(id, key)
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    async fn has_edges(&self, id: NodeId) -> Result<bool> {
        Ok(!self.edges(id, Direction::Both, None).await?.is_empty())
    }
}

impl<T: GraphBackend + ?Sized> GraphBackendExt for T {}
