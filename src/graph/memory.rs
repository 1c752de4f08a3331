//! In-memory implementation of GraphBackend.
//!
//! Keeps the committed graph behind a `tokio::sync::RwLock`. A transaction
//! works on a copy of the committed state taken at `begin_transaction`,
//! swapped in on commit and dropped on rollback. Batch mode writes straight
//! into the committed state. An optional JSON snapshot file makes the graph
//! durable across restarts.

use super::backend::{BackendMode, GraphBackend};
use super::model::*;
use crate::error::IndexError;
use crate::index::{DualIndex, IndexEntity, IndexQuery};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct NodeRecord {
    node: GraphNode,
    outgoing: BTreeSet<EdgeId>,
    incoming: BTreeSet<EdgeId>,
}

impl NodeRecord {
    fn has_edges(&self) -> bool {
        !self.outgoing.is_empty() || !self.incoming.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    next_id: u64,
    nodes: HashMap<NodeId, NodeRecord>,
    edges: HashMap<EdgeId, GraphEdge>,
    indexes: BTreeMap<String, DualIndex>,
}

impl GraphState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeRecord> {
        match self.nodes.get_mut(&id) {
            Some(record) => Ok(record),
            None => bail!(IndexError::StorageInconsistency(format!(
                "node {} does not exist",
                id
            ))),
        }
    }

    fn to_snapshot(&self) -> StateSnapshot {
        let mut nodes: Vec<GraphNode> = self.nodes.values().map(|r| r.node.clone()).collect();
        nodes.sort_by_key(|n| n.id);
        let mut edges: Vec<GraphEdge> = self.edges.values().cloned().collect();
        edges.sort_by_key(|e| e.id);
        StateSnapshot {
            next_id: self.next_id,
            nodes,
            edges,
            indexes: self.indexes.clone(),
        }
    }

    fn from_snapshot(snapshot: StateSnapshot) -> Result<Self> {
        let mut state = GraphState {
            next_id: snapshot.next_id,
            indexes: snapshot.indexes,
            ..Default::default()
        };
        for node in snapshot.nodes {
            state.nodes.insert(
                node.id,
                NodeRecord {
                    node,
                    outgoing: BTreeSet::new(),
                    incoming: BTreeSet::new(),
                },
            );
        }
        for edge in snapshot.edges {
            state.node_mut(edge.start)?.outgoing.insert(edge.id);
            state.node_mut(edge.end)?.incoming.insert(edge.id);
            state.edges.insert(edge.id, edge);
        }
        Ok(state)
    }
}

/// On-disk form of the committed graph; adjacency is rebuilt on load.
#[derive(Debug, Serialize, Deserialize)]
struct StateSnapshot {
    next_id: u64,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    indexes: BTreeMap<String, DualIndex>,
}

#[derive(Debug, Default)]
struct Inner {
    committed: GraphState,
    tx: Option<GraphState>,
    batch: bool,
}

impl Inner {
    fn read(&self) -> &GraphState {
        self.tx.as_ref().unwrap_or(&self.committed)
    }

    fn write(&mut self) -> Result<&mut GraphState> {
        match (&mut self.tx, self.batch) {
            (Some(tx), _) => Ok(tx),
            (None, true) => Ok(&mut self.committed),
            (None, false) => bail!(IndexError::Transaction(
                "mutation outside of a transaction or batch window".into()
            )),
        }
    }
}

/// In-memory graph backend with copy-on-begin transactions.
///
/// # Example
///
/// ```rust
/// use model_indexer::graph::{GraphBackend, InMemoryBackend, Properties};
///
/// # tokio_test::block_on(async {
/// let backend = InMemoryBackend::new();
/// backend.begin_transaction().await.unwrap();
/// backend.create_node("element", Properties::new()).await.unwrap();
/// backend.rollback().await.unwrap();
///
/// // nothing of an aborted transaction is visible
/// assert_eq!(backend.node_count().await.unwrap(), 0);
/// # });
/// ```
pub struct InMemoryBackend {
    inner: RwLock<Inner>,
    snapshot_path: Option<PathBuf>,
}

impl InMemoryBackend {
    /// Create a new empty, non-durable backend.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            snapshot_path: None,
        }
    }

    /// Open a durable backend persisted at `path`, loading the snapshot if
    /// one exists.
    pub async fn open(path: &Path) -> Result<Self> {
        let committed = match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: StateSnapshot = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to decode graph snapshot {}", path.display()))?;
                let state = GraphState::from_snapshot(snapshot)?;
                tracing::info!(
                    path = %path.display(),
                    nodes = state.nodes.len(),
                    edges = state.edges.len(),
                    "Loaded graph snapshot"
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No graph snapshot at {}, starting empty", path.display());
                GraphState::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        Ok(Self {
            inner: RwLock::new(Inner {
                committed,
                ..Default::default()
            }),
            snapshot_path: Some(path.to_path_buf()),
        })
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphBackend for InMemoryBackend {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    // ========================================================================
    // Write contexts
    // ========================================================================

    async fn mode(&self) -> BackendMode {
        let inner = self.inner.read().await;
        if inner.tx.is_some() {
            BackendMode::Transaction
        } else if inner.batch {
            BackendMode::Batch
        } else {
            BackendMode::Idle
        }
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.batch {
            bail!(IndexError::Transaction(
                "cannot begin a transaction inside a batch window".into()
            ));
        }
        if inner.tx.is_some() {
            bail!(IndexError::Transaction("a transaction is already open".into()));
        }
        inner.tx = Some(inner.committed.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.tx.take() {
            Some(state) => {
                inner.committed = state;
                Ok(())
            }
            None => bail!(IndexError::Transaction("no open transaction to commit".into())),
        }
    }

    async fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.tx.take().is_none() {
            bail!(IndexError::Transaction("no open transaction to roll back".into()));
        }
        Ok(())
    }

    async fn enter_batch_mode(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.tx.is_some() {
            bail!(IndexError::Transaction(
                "cannot enter batch mode while a transaction is open".into()
            ));
        }
        inner.batch = true;
        Ok(())
    }

    async fn exit_batch_mode(&self) -> Result<()> {
        self.inner.write().await.batch = false;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = {
            let inner = self.inner.read().await;
            serde_json::to_vec(&inner.committed.to_snapshot())?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn create_node(&self, label: &str, properties: Properties) -> Result<NodeId> {
        let mut inner = self.inner.write().await;
        let state = inner.write()?;
        let id = NodeId(state.allocate());
        state.nodes.insert(
            id,
            NodeRecord {
                node: GraphNode {
                    id,
                    label: label.to_string(),
                    properties,
                },
                outgoing: BTreeSet::new(),
                incoming: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn delete_node(&self, id: NodeId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let state = inner.write()?;
        match state.nodes.get(&id) {
            Some(record) if !record.has_edges() => {}
            _ => return Ok(false),
        }
        state.nodes.remove(&id);
        for index in state.indexes.values_mut() {
            index.remove_entity(IndexEntity::Node(id));
        }
        Ok(true)
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<GraphNode>> {
        let inner = self.inner.read().await;
        Ok(inner.read().nodes.get(&id).map(|r| r.node.clone()))
    }

    async fn nodes_by_label(&self, label: &str) -> Result<Vec<NodeId>> {
        let inner = self.inner.read().await;
        let mut ids: Vec<NodeId> = inner
            .read()
            .nodes
            .values()
            .filter(|r| r.node.label == label)
            .map(|r| r.node.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_property(&self, id: NodeId, key: &str) -> Result<Option<PropertyValue>> {
        let inner = self.inner.read().await;
        Ok(inner
            .read()
            .nodes
            .get(&id)
            .and_then(|r| r.node.properties.get(key).cloned()))
    }

    async fn set_property(&self, id: NodeId, key: &str, value: PropertyValue) -> Result<()> {
        if !value.is_homogeneous() {
            bail!("Property {} on {} must be a homogeneous array", key, id);
        }
        let mut inner = self.inner.write().await;
        let record = inner.write()?.node_mut(id)?;
        record.node.properties.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_property(&self, id: NodeId, key: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner.write()?.node_mut(id)?;
        record.node.properties.remove(key);
        Ok(())
    }

    // ========================================================================
    // Edges
    // ========================================================================

    async fn create_edge(
        &self,
        start: NodeId,
        end: NodeId,
        label: &str,
        properties: Properties,
    ) -> Result<EdgeId> {
        let mut inner = self.inner.write().await;
        let state = inner.write()?;
        if !state.nodes.contains_key(&start) || !state.nodes.contains_key(&end) {
            bail!(IndexError::StorageInconsistency(format!(
                "edge {} endpoints {} -> {} must both exist",
                label, start, end
            )));
        }
        let id = EdgeId(state.allocate());
        state.node_mut(start)?.outgoing.insert(id);
        state.node_mut(end)?.incoming.insert(id);
        state.edges.insert(
            id,
            GraphEdge {
                id,
                label: label.to_string(),
                start,
                end,
                properties,
            },
        );
        Ok(id)
    }

    async fn delete_edge(&self, id: EdgeId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let state = inner.write()?;
        let Some(edge) = state.edges.remove(&id) else {
            return Ok(());
        };
        if let Some(record) = state.nodes.get_mut(&edge.start) {
            record.outgoing.remove(&id);
        }
        if let Some(record) = state.nodes.get_mut(&edge.end) {
            record.incoming.remove(&id);
        }
        for index in state.indexes.values_mut() {
            index.remove_entity(IndexEntity::Edge(id));
        }
        Ok(())
    }

    async fn get_edge(&self, id: EdgeId) -> Result<Option<GraphEdge>> {
        let inner = self.inner.read().await;
        Ok(inner.read().edges.get(&id).cloned())
    }

    async fn edges(
        &self,
        node: NodeId,
        direction: Direction,
        label: Option<&str>,
    ) -> Result<Vec<GraphEdge>> {
        let inner = self.inner.read().await;
        let state = inner.read();
        let Some(record) = state.nodes.get(&node) else {
            return Ok(Vec::new());
        };
        let ids: Vec<&EdgeId> = match direction {
            Direction::Outgoing => record.outgoing.iter().collect(),
            Direction::Incoming => record.incoming.iter().collect(),
            Direction::Both => record.outgoing.union(&record.incoming).collect(),
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| state.edges.get(id))
            .filter(|e| label.is_none_or(|l| e.label == l))
            .cloned()
            .collect())
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    async fn index_add(
        &self,
        index: &str,
        entity: IndexEntity,
        key: &str,
        value: PropertyValue,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .write()?
            .indexes
            .entry(index.to_string())
            .or_default()
            .add(entity, key, &value);
        Ok(())
    }

    async fn index_remove(
        &self,
        index: &str,
        entity: IndexEntity,
        key: Option<&str>,
        value: Option<&PropertyValue>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(idx) = inner.write()?.indexes.get_mut(index) {
            idx.remove(entity, key, value);
        }
        Ok(())
    }

    async fn index_query(
        &self,
        index: &str,
        key: &str,
        query: &IndexQuery,
    ) -> Result<Vec<IndexEntity>> {
        let inner = self.inner.read().await;
        match inner.read().indexes.get(index) {
            Some(idx) => Ok(idx.query(key, query)?.into_iter().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn index_values(&self, index: &str, key: &str) -> Result<Vec<PropertyValue>> {
        let inner = self.inner.read().await;
        Ok(inner
            .read()
            .indexes
            .get(index)
            .map(|idx| idx.values(key))
            .unwrap_or_default())
    }

    async fn index_names(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner.read().indexes.keys().cloned().collect())
    }

    async fn drop_index(&self, index: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.write()?.indexes.remove(index);
        Ok(())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    async fn node_count(&self) -> Result<usize> {
        Ok(self.inner.read().await.read().nodes.len())
    }

    async fn edge_count(&self) -> Result<usize> {
        Ok(self.inner.read().await.read().edges.len())
    }
}
