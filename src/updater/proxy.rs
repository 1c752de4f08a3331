//! Proxy markers for references whose target is not currently indexed.
//!
//! An unresolved reference is recorded on the referencing node in the
//! property `_proxyRef:<target file key>` as a list of [`ProxyRef`] records,
//! and the node is bound in the proxy index under that file key. When the
//! target file is (re)indexed, [`GraphUpdater::resolve_proxies`] turns the
//! records back into live edges.

use super::GraphUpdater;
use crate::events::GraphChange;
use crate::graph::backend::{GraphBackend, GraphBackendExt};
use crate::graph::model::{indexes, props, NodeId, Properties, PropertyValue};
use crate::index::IndexQuery;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// A reference waiting for its target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRef {
    pub fragment: String,
    pub label: String,
    pub containment: bool,
    pub container: bool,
}

pub(crate) fn marker_key(target_file: &str) -> String {
    format!("{}{}", props::PROXY_PREFIX, target_file)
}

/// Edge properties of a materialized reference.
pub(crate) fn reference_properties(containment: bool, container: bool) -> Properties {
    let mut properties = Properties::new();
    if containment {
        properties.insert(props::CONTAINMENT.into(), true.into());
    }
    if container {
        properties.insert(props::CONTAINER.into(), true.into());
    }
    properties
}

impl GraphUpdater {
    /// Every proxy marker on `node`, grouped by target file key.
    pub async fn proxy_markers(&self, node: NodeId) -> Result<BTreeMap<String, Vec<ProxyRef>>> {
        let Some(graph_node) = self.backend.get_node(node).await? else {
            return Ok(BTreeMap::new());
        };
        let mut markers = BTreeMap::new();
        for (key, value) in &graph_node.properties {
            let Some(target) = key.strip_prefix(props::PROXY_PREFIX) else {
                continue;
            };
            markers.insert(target.to_string(), decode_markers(node, value)?);
        }
        Ok(markers)
    }

    async fn markers_for(&self, node: NodeId, target_file: &str) -> Result<Vec<ProxyRef>> {
        match self.backend.get_property(node, &marker_key(target_file)).await? {
            Some(value) => decode_markers(node, &value),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the markers of `node` towards `target_file`; an empty list
    /// drops the property and the proxy index binding.
    pub(crate) async fn write_markers(
        &self,
        node: NodeId,
        target_file: &str,
        markers: &[ProxyRef],
    ) -> Result<()> {
        let key = marker_key(target_file);
        if markers.is_empty() {
            self.backend.remove_property(node, &key).await?;
            self.backend
                .index_remove(
                    indexes::PROXIES,
                    node.into(),
                    Some(indexes::TARGET_FIELD),
                    Some(&PropertyValue::from(target_file)),
                )
                .await?;
        } else {
            self.backend
                .set_property(node, &key, PropertyValue::Json(serde_json::to_value(markers)?))
                .await?;
            self.backend
                .index_add(
                    indexes::PROXIES,
                    node.into(),
                    indexes::TARGET_FIELD,
                    target_file.into(),
                )
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn add_proxy(&self, node: NodeId, target_file: &str, marker: ProxyRef) -> Result<()> {
        let mut markers = self.markers_for(node, target_file).await?;
        if !markers.contains(&marker) {
            markers.push(marker);
        }
        self.write_markers(node, target_file, &markers).await
    }

    /// Swap the markers recorded for reference feature `label` with
    /// `replacement`, leaving other features' markers alone.
    pub(crate) async fn replace_proxies(
        &self,
        node: NodeId,
        label: &str,
        replacement: Vec<(String, ProxyRef)>,
    ) -> Result<()> {
        let current = self.proxy_markers(node).await?;
        let mut next: BTreeMap<String, Vec<ProxyRef>> = current
            .iter()
            .map(|(target, markers)| {
                let kept = markers.iter().filter(|m| m.label != label).cloned().collect();
                (target.clone(), kept)
            })
            .collect();
        for (target, marker) in replacement {
            let markers = next.entry(target).or_default();
            if !markers.contains(&marker) {
                markers.push(marker);
            }
        }
        for (target, markers) in &next {
            if current.get(target) != Some(markers) {
                self.write_markers(node, target, markers).await?;
            }
        }
        Ok(())
    }

    /// Drop every marker held by `node`.
    pub(crate) async fn clear_proxies(&self, node: NodeId) -> Result<()> {
        for target in self.proxy_markers(node).await?.into_keys() {
            self.write_markers(node, &target, &[]).await?;
        }
        Ok(())
    }

    /// Materialize every marker whose target file and fragment are now
    /// indexed. Markers whose target is still absent stay untouched.
    /// Returns the number of edges created.
    ///
    /// A source's edges and its rewritten markers are stored before any
    /// `ReferenceAdded` is emitted, so a failing listener cannot leave a
    /// reference both live and pending.
    pub async fn resolve_proxies(&self) -> Result<usize> {
        let targets: Vec<String> = self
            .backend
            .index_values(indexes::PROXIES, indexes::TARGET_FIELD)
            .await?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        let mut resolved = 0;
        for target_file in targets {
            if self.file_node_by_key(&target_file).await?.is_none() {
                continue;
            }
            let sources = self
                .backend
                .index_nodes(
                    indexes::PROXIES,
                    indexes::TARGET_FIELD,
                    &IndexQuery::Exact(target_file.clone().into()),
                )
                .await?;
            for source in sources {
                let mut remaining = Vec::new();
                let mut created = Vec::new();
                for marker in self.markers_for(source, &target_file).await? {
                    match self.lookup_fragment(&target_file, &marker.fragment).await? {
                        Some(target) => {
                            self.backend
                                .create_edge(
                                    source,
                                    target,
                                    &marker.label,
                                    reference_properties(marker.containment, marker.container),
                                )
                                .await?;
                            created.push((target, marker.label));
                        }
                        None => remaining.push(marker),
                    }
                }
                if created.is_empty() {
                    continue;
                }
                self.write_markers(source, &target_file, &remaining).await?;
                resolved += created.len();
                for (target, label) in created {
                    self.emit(GraphChange::ReferenceAdded {
                        source,
                        target,
                        label,
                        transient: false,
                    })?;
                }
            }
        }
        if resolved > 0 {
            debug!(resolved, "Resolved proxy references");
        }
        Ok(resolved)
    }
}

fn decode_markers(node: NodeId, value: &PropertyValue) -> Result<Vec<ProxyRef>> {
    match value {
        PropertyValue::Json(json) => serde_json::from_value(json.clone())
            .with_context(|| format!("Corrupt proxy marker on {}", node)),
        _ => Ok(Vec::new()),
    }
}
