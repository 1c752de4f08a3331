//! Derived attributes
//!
//! A derived attribute lives in its own node, linked from the element by an
//! edge named after the attribute and flagged `is_derived`. The node holds
//! either the stale sentinel or the last computed value.
//!
//! Recomputation runs once per cycle, after every artifact has been applied:
//! the [`DirtyDerivedTracker`] hands over what changed, the access index maps
//! those changes to the derived nodes that read them, and every dirty or
//! stale node is evaluated again.
//!
//! ## Modules
//!
//! - [`evaluator`]: evaluator trait, access-recording context, built-ins
//! - [`tracker`]: change listener collecting dirty keys

pub mod evaluator;
pub mod tracker;

pub use evaluator::{AttrEvaluator, DerivedEvaluator, EvalContext, EvaluatorRegistry, ATTR_LANGUAGE};
pub use tracker::{DirtyDerivedTracker, ALL_KEYS};

use crate::error::IndexError;
use crate::events::{CompositeListener, GraphChange};
use crate::graph::backend::{GraphBackend, GraphBackendExt};
use crate::graph::model::{edges, indexes, labels, props, Direction, NodeId, Properties, PropertyValue};
use crate::index::IndexQuery;
use crate::model::{DerivedAttributeSpec, DerivedDef, FeatureDef, MetamodelRegistry};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Content of a derived attribute node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DerivedValue {
    /// Needs evaluation.
    Stale { language: String, expression: String },
    Ready { value: PropertyValue },
}

impl DerivedValue {
    pub fn stale(language: &str, expression: &str) -> Self {
        DerivedValue::Stale {
            language: language.to_string(),
            expression: expression.to_string(),
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, DerivedValue::Stale { .. })
    }

    pub fn to_property(&self) -> Result<PropertyValue> {
        Ok(PropertyValue::Json(serde_json::to_value(self)?))
    }

    pub fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Json(json) => serde_json::from_value(json.clone()).ok(),
            _ => None,
        }
    }
}

/// Attach a stale derived attribute node to `element`.
pub(crate) async fn attach(backend: &dyn GraphBackend, element: NodeId, def: &DerivedDef) -> Result<NodeId> {
    let mut properties = Properties::new();
    properties.insert(props::ATTRIBUTE.into(), def.name.clone().into());
    properties.insert(props::LANGUAGE.into(), def.language.clone().into());
    properties.insert(props::EXPRESSION.into(), def.expression.clone().into());
    properties.insert(
        props::DERIVED_VALUE.into(),
        DerivedValue::stale(&def.language, &def.expression).to_property()?,
    );
    let node = backend.create_node(labels::DERIVED, properties).await?;

    let mut edge_props = Properties::new();
    edge_props.insert(props::IS_DERIVED.into(), true.into());
    backend.create_edge(element, node, &def.name, edge_props).await?;
    backend
        .index_add(indexes::STALE, node.into(), indexes::STALE_FIELD, indexes::STALE_FIELD.into())
        .await?;
    Ok(node)
}

/// Result of one recomputation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecomputeReport {
    pub marked: usize,
    pub evaluated: usize,
    pub failed: usize,
}

/// Owns derived attribute maintenance: dirty marking, recomputation and
/// adding or removing derived attributes on existing types.
pub struct DerivedManager {
    backend: Arc<dyn GraphBackend>,
    registry: MetamodelRegistry,
    listeners: Arc<CompositeListener>,
    tracker: Arc<DirtyDerivedTracker>,
    evaluators: EvaluatorRegistry,
}

impl DerivedManager {
    pub fn new(
        backend: Arc<dyn GraphBackend>,
        listeners: Arc<CompositeListener>,
        tracker: Arc<DirtyDerivedTracker>,
        evaluators: EvaluatorRegistry,
    ) -> Self {
        Self {
            registry: MetamodelRegistry::new(backend.clone()),
            backend,
            listeners,
            tracker,
            evaluators,
        }
    }

    pub fn tracker(&self) -> &Arc<DirtyDerivedTracker> {
        &self.tracker
    }

    pub fn evaluators(&self) -> &EvaluatorRegistry {
        &self.evaluators
    }

    /// Current value of a derived attribute of `element`.
    pub async fn value(&self, element: NodeId, attribute: &str) -> Result<Option<DerivedValue>> {
        let Some(node) = self.derived_node(element, attribute).await? else {
            return Ok(None);
        };
        Ok(self
            .backend
            .get_property(node, props::DERIVED_VALUE)
            .await?
            .as_ref()
            .and_then(DerivedValue::from_property))
    }

    async fn derived_node(&self, element: NodeId, attribute: &str) -> Result<Option<NodeId>> {
        Ok(self
            .backend
            .edges(element, Direction::Outgoing, Some(attribute))
            .await?
            .into_iter()
            .find(|e| e.flag(props::IS_DERIVED))
            .map(|e| e.end))
    }

    /// Mark every derived node depending on a recorded change as stale.
    /// Returns the dirty set. On failure the drained changes go back to the
    /// tracker.
    pub async fn mark_dirty(&self) -> Result<BTreeSet<NodeId>> {
        let pending = self.tracker.take_pending();
        let marked = self.mark_entries(&pending).await;
        if marked.is_err() {
            self.tracker.requeue(pending);
        }
        marked
    }

    async fn mark_entries(&self, pending: &[(NodeId, String)]) -> Result<BTreeSet<NodeId>> {
        let pending: BTreeSet<&(NodeId, String)> = pending.iter().collect();
        let mut dirty = BTreeSet::new();
        for (element, key) in pending {
            let query = if key == ALL_KEYS {
                IndexQuery::all()
            } else {
                IndexQuery::Exact(key.as_str().into())
            };
            for node in self
                .backend
                .index_nodes(indexes::DERIVED_ACCESS, &element.to_string(), &query)
                .await?
            {
                if dirty.contains(&node) {
                    continue;
                }
                if self.mark_stale(node).await? {
                    dirty.insert(node);
                }
            }
        }
        Ok(dirty)
    }

    async fn mark_stale(&self, node: NodeId) -> Result<bool> {
        let Some(derived) = self.backend.get_node(node).await? else {
            return Ok(false);
        };
        let language = derived.string_property(props::LANGUAGE).unwrap_or_default();
        let expression = derived.string_property(props::EXPRESSION).unwrap_or_default();
        self.backend
            .set_property(
                node,
                props::DERIVED_VALUE,
                DerivedValue::stale(language, expression).to_property()?,
            )
            .await?;
        self.backend
            .index_add(indexes::STALE, node.into(), indexes::STALE_FIELD, indexes::STALE_FIELD.into())
            .await?;
        Ok(true)
    }

    /// Evaluate the dirty nodes plus every node still holding the stale
    /// sentinel. A failed evaluation leaves the sentinel in place.
    pub async fn recompute(&self, dirty: BTreeSet<NodeId>) -> Result<RecomputeReport> {
        let mut report = RecomputeReport {
            marked: dirty.len(),
            ..Default::default()
        };
        let mut pending = dirty;
        pending.extend(
            self.backend
                .index_nodes(indexes::STALE, indexes::STALE_FIELD, &IndexQuery::all())
                .await?,
        );

        for node in pending {
            match self.evaluate(node).await {
                Ok(true) => report.evaluated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(node = %node, error = %e, "Derived attribute evaluation failed");
                    report.failed += 1;
                }
            }
        }
        if report.evaluated > 0 || report.failed > 0 {
            debug!(
                marked = report.marked,
                evaluated = report.evaluated,
                failed = report.failed,
                "Recomputed derived attributes"
            );
        }
        Ok(report)
    }

    /// Mark from the tracker, then recompute.
    pub async fn run(&self) -> Result<RecomputeReport> {
        let pending = self.tracker.take_pending();
        let outcome = match self.mark_entries(&pending).await {
            Ok(dirty) => self.recompute(dirty).await,
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            self.tracker.requeue(pending);
        }
        outcome
    }

    async fn evaluate(&self, node: NodeId) -> Result<bool> {
        let Some(derived) = self.backend.get_node(node).await? else {
            return Ok(false);
        };
        let attribute = derived.string_property(props::ATTRIBUTE).unwrap_or_default().to_string();
        let language = derived.string_property(props::LANGUAGE).unwrap_or_default();
        let expression = derived.string_property(props::EXPRESSION).unwrap_or_default();

        let Some(element) = self
            .backend
            .edges(node, Direction::Incoming, Some(&attribute))
            .await?
            .into_iter()
            .find(|e| e.flag(props::IS_DERIVED))
            .map(|e| e.start)
        else {
            bail!(IndexError::StorageInconsistency(format!(
                "derived attribute node {} has no owning element",
                node
            )));
        };
        let Some(evaluator) = self.evaluators.get(language) else {
            bail!(IndexError::Evaluator {
                attribute,
                reason: format!("no evaluator for language {}", language),
            });
        };

        let mut ctx = EvalContext::new(self.backend.as_ref(), element);
        let value = evaluator.evaluate(expression, &mut ctx).await?;
        self.store(node, element, &attribute, value, ctx.into_accesses())
            .await?;
        Ok(true)
    }

    async fn store(
        &self,
        node: NodeId,
        element: NodeId,
        attribute: &str,
        value: PropertyValue,
        accesses: BTreeSet<(NodeId, String)>,
    ) -> Result<()> {
        self.backend
            .set_property(
                node,
                props::DERIVED_VALUE,
                DerivedValue::Ready { value: value.clone() }.to_property()?,
            )
            .await?;
        self.backend
            .index_remove(indexes::STALE, node.into(), None, None)
            .await?;
        self.backend
            .index_remove(indexes::DERIVED_ACCESS, node.into(), None, None)
            .await?;
        for (accessed, key) in accesses {
            self.backend
                .index_add(indexes::DERIVED_ACCESS, node.into(), &accessed.to_string(), key.into())
                .await?;
        }

        if let Some(index) = self.value_index(element, attribute).await? {
            self.backend
                .index_remove(&index, element.into(), Some(attribute), None)
                .await?;
            self.backend
                .index_add(&index, element.into(), attribute, value.clone())
                .await?;
        }
        self.listeners.notify(&GraphChange::AttributeUpdated {
            element,
            attribute: attribute.to_string(),
            value,
            transient: true,
        })
    }

    /// Per-type index of `attribute` for the concrete type of `element`.
    async fn value_index(&self, element: NodeId, attribute: &str) -> Result<Option<String>> {
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
        let type_name = self.backend.string_property(edge.end, props::NAME).await?;
        Ok(metamodel
            .zip(type_name)
            .map(|(mm, name)| indexes::attribute_index(&mm, &name, attribute)))
    }

    // ========================================================================
    // Type system changes
    // ========================================================================

    async fn declaring_type(&self, spec: &DerivedAttributeSpec) -> Result<NodeId> {
        match self.registry.type_node(&spec.metamodel, &spec.type_name).await? {
            Some(node) => Ok(node),
            None if !self.registry.is_registered(&spec.metamodel).await? => {
                bail!(IndexError::MetamodelNotRegistered {
                    uri: spec.metamodel.clone()
                })
            }
            None => bail!(IndexError::StorageInconsistency(format!(
                "type {} not found in {}",
                spec.type_name, spec.metamodel
            ))),
        }
    }

    /// Declare a derived attribute on a type and attach a stale node to
    /// every existing instance of it and its subtypes. Redeclaring an
    /// attribute replaces its definition. Returns the number of nodes
    /// attached.
    pub async fn add_derived_attribute(&self, spec: &DerivedAttributeSpec) -> Result<usize> {
        let type_node = self.declaring_type(spec).await?;
        let mut features = self.registry.features(type_node).await?;
        features.retain(|f| f.name() != spec.attribute.name);
        features.push(FeatureDef::Derived(spec.attribute.clone()));
        self.registry.set_features(type_node, &features).await?;

        let mut attached = 0;
        for type_node in self.registry.with_subtypes(&spec.metamodel, &spec.type_name).await? {
            for element in self.registry.instances(type_node).await? {
                self.detach(element, &spec.attribute.name).await?;
                attach(self.backend.as_ref(), element, &spec.attribute).await?;
                attached += 1;
            }
        }
        debug!(
            metamodel = %spec.metamodel,
            type_name = %spec.type_name,
            attribute = %spec.attribute.name,
            attached,
            "Added derived attribute"
        );
        Ok(attached)
    }

    /// Remove a derived attribute declaration and its nodes. Returns the
    /// number of nodes removed.
    pub async fn remove_derived_attribute(&self, spec: &DerivedAttributeSpec) -> Result<usize> {
        let type_node = self.declaring_type(spec).await?;
        let mut features = self.registry.features(type_node).await?;
        let before = features.len();
        features.retain(|f| !matches!(f, FeatureDef::Derived(d) if d.name == spec.attribute.name));
        if features.len() != before {
            self.registry.set_features(type_node, &features).await?;
        }

        let mut removed = 0;
        for type_node in self.registry.with_subtypes(&spec.metamodel, &spec.type_name).await? {
            let type_name = self
                .backend
                .string_property(type_node, props::NAME)
                .await?
                .unwrap_or_default();
            let index = indexes::attribute_index(&spec.metamodel, &type_name, &spec.attribute.name);
            for element in self.registry.instances(type_node).await? {
                if self.detach(element, &spec.attribute.name).await? {
                    self.backend
                        .index_remove(&index, element.into(), Some(&spec.attribute.name), None)
                        .await?;
                    self.listeners.notify(&GraphChange::AttributeRemoved {
                        element,
                        attribute: spec.attribute.name.clone(),
                        transient: false,
                    })?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn detach(&self, element: NodeId, attribute: &str) -> Result<bool> {
        let mut detached = false;
        for edge in self
            .backend
            .edges(element, Direction::Outgoing, Some(attribute))
            .await?
        {
            if edge.flag(props::IS_DERIVED) {
                self.backend.delete_edge(edge.id).await?;
                self.backend.delete_node(edge.end).await?;
                detached = true;
            }
        }
        Ok(detached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeListener;
    use crate::graph::InMemoryBackend;
    use crate::model::ElementTree;
    use crate::test_helpers::{component, label_spec, ARCH_URI};
    use crate::updater::GraphUpdater;

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        updater: GraphUpdater,
        manager: DerivedManager,
    }

    async fn fixture() -> Fixture {
        let (backend, _) = crate::test_helpers::indexed_updater().await;
        let listeners = Arc::new(CompositeListener::new());
        let tracker = Arc::new(DirtyDerivedTracker::new());
        listeners.add(tracker.clone() as Arc<dyn ChangeListener>);
        let updater = GraphUpdater::new(backend.clone(), listeners.clone());
        let manager = DerivedManager::new(backend.clone(), listeners, tracker, EvaluatorRegistry::default());
        Fixture {
            backend,
            updater,
            manager,
        }
    }

    #[tokio::test]
    async fn test_added_attribute_is_computed_and_recomputed() {
        let f = fixture().await;
        let tree = ElementTree {
            elements: vec![component("a", "Alpha")],
        };
        f.backend.begin_transaction().await.unwrap();
        f.updater.update_file("repo", "a.model.json", "r1", Some(&tree)).await.unwrap();
        assert_eq!(f.manager.add_derived_attribute(&label_spec()).await.unwrap(), 1);
        let report = f.manager.run().await.unwrap();
        f.backend.commit().await.unwrap();
        assert_eq!(report.evaluated, 1);

        let a = f.updater.lookup_fragment("repo::a.model.json", "a").await.unwrap().unwrap();
        assert_eq!(
            f.manager.value(a, "label").await.unwrap(),
            Some(DerivedValue::Ready { value: "Alpha".into() })
        );

        // changing the read attribute marks the value dirty
        f.updater.clear_type_cache();
        let renamed = ElementTree {
            elements: vec![component("a", "Beta")],
        };
        f.backend.begin_transaction().await.unwrap();
        f.updater.update_file("repo", "a.model.json", "r2", Some(&renamed)).await.unwrap();
        let dirty = f.manager.mark_dirty().await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert!(f.manager.value(a, "label").await.unwrap().unwrap().is_stale());
        f.manager.recompute(dirty).await.unwrap();
        f.backend.commit().await.unwrap();

        assert_eq!(
            f.manager.value(a, "label").await.unwrap(),
            Some(DerivedValue::Ready { value: "Beta".into() })
        );
        let index = indexes::attribute_index(ARCH_URI, "Component", "label");
        let hits = f
            .backend
            .index_nodes(&index, "label", &IndexQuery::Exact("Beta".into()))
            .await
            .unwrap();
        assert_eq!(hits, vec![a]);
    }

    #[tokio::test]
    async fn test_failed_evaluation_keeps_sentinel() {
        let f = fixture().await;
        let tree = ElementTree {
            elements: vec![crate::test_helpers::arch_element("a", "Component")],
        };
        f.backend.begin_transaction().await.unwrap();
        f.updater.update_file("repo", "a.model.json", "r1", Some(&tree)).await.unwrap();
        f.manager.add_derived_attribute(&label_spec()).await.unwrap();
        let report = f.manager.run().await.unwrap();
        f.backend.commit().await.unwrap();

        assert_eq!(report.failed, 1);
        let a = f.updater.lookup_fragment("repo::a.model.json", "a").await.unwrap().unwrap();
        assert!(f.manager.value(a, "label").await.unwrap().unwrap().is_stale());
        let stale = f
            .backend
            .index_nodes(indexes::STALE, indexes::STALE_FIELD, &IndexQuery::all())
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_derived_attribute() {
        let f = fixture().await;
        let tree = ElementTree {
            elements: vec![component("a", "Alpha")],
        };
        f.backend.begin_transaction().await.unwrap();
        f.updater.update_file("repo", "a.model.json", "r1", Some(&tree)).await.unwrap();
        f.manager.add_derived_attribute(&label_spec()).await.unwrap();
        f.manager.run().await.unwrap();
        assert_eq!(f.manager.remove_derived_attribute(&label_spec()).await.unwrap(), 1);
        f.backend.commit().await.unwrap();

        let a = f.updater.lookup_fragment("repo::a.model.json", "a").await.unwrap().unwrap();
        assert!(f.manager.value(a, "label").await.unwrap().is_none());
        assert!(f.backend.nodes_by_label(labels::DERIVED).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_metamodel_is_rejected() {
        let f = fixture().await;
        let mut spec = label_spec();
        spec.metamodel = "urn:missing".into();
        f.backend.begin_transaction().await.unwrap();
        let err = f.manager.add_derived_attribute(&spec).await.unwrap_err();
        f.backend.rollback().await.unwrap();
        assert!(matches!(
            crate::error::classify(&err),
            Some(IndexError::MetamodelNotRegistered { .. })
        ));
    }

    #[test]
    fn test_derived_value_json_shape() {
        let value = DerivedValue::stale("attr", "name").to_property().unwrap();
        let PropertyValue::Json(json) = &value else {
            panic!("expected json");
        };
        assert_eq!(json["state"], "stale");
        assert!(DerivedValue::from_property(&value).unwrap().is_stale());
    }

    #[tokio::test]
    async fn test_deleting_element_with_attached_derived_node_edges_fails() {
        let f = fixture().await;
        let tree = ElementTree {
            elements: vec![component("a", "Alpha")],
        };
        f.backend.begin_transaction().await.unwrap();
        f.updater.update_file("repo", "a.model.json", "r1", Some(&tree)).await.unwrap();
        f.manager.add_derived_attribute(&label_spec()).await.unwrap();
        let a = f.updater.lookup_fragment("repo::a.model.json", "a").await.unwrap().unwrap();
        let derived = f.manager.derived_node(a, "label").await.unwrap().unwrap();
        f.backend
            .create_edge(derived, a, "stray", Properties::new())
            .await
            .unwrap();

        let err = f.updater.delete_path("repo", "a.model.json").await.unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(IndexError::StorageInconsistency(_))
        ));
        f.backend.rollback().await.unwrap();
    }
}
