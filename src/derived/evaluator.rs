//! Derived attribute evaluators
//!
//! An evaluator computes one derived value from an expression. Every graph
//! read goes through [`EvalContext`], which records the `(element,
//! attribute)` pairs touched so the dirty tracker knows what the value
//! depends on.

use super::DerivedValue;
use crate::error::IndexError;
use crate::graph::backend::GraphBackend;
use crate::graph::model::{props, Direction, NodeId, PropertyValue};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Language id of the built-in path evaluator.
pub const ATTR_LANGUAGE: &str = "attr";

#[async_trait]
pub trait DerivedEvaluator: Send + Sync {
    fn language(&self) -> &str;

    async fn evaluate(&self, expression: &str, ctx: &mut EvalContext<'_>) -> Result<PropertyValue>;
}

/// Read access to the graph for one evaluation.
pub struct EvalContext<'a> {
    backend: &'a dyn GraphBackend,
    element: NodeId,
    accesses: BTreeSet<(NodeId, String)>,
}

impl<'a> EvalContext<'a> {
    pub fn new(backend: &'a dyn GraphBackend, element: NodeId) -> Self {
        Self {
            backend,
            element,
            accesses: BTreeSet::new(),
        }
    }

    /// The element owning the derived attribute.
    pub fn element(&self) -> NodeId {
        self.element
    }

    /// Attribute value of `node`. Derived attributes resolve to their
    /// current value, or `None` while stale.
    pub async fn attribute(&mut self, node: NodeId, name: &str) -> Result<Option<PropertyValue>> {
        self.accesses.insert((node, name.to_string()));
        if !name.starts_with('_') {
            if let Some(value) = self.backend.get_property(node, name).await? {
                return Ok(Some(value));
            }
        }
        for edge in self
            .backend
            .edges(node, Direction::Outgoing, Some(name))
            .await?
        {
            if !edge.flag(props::IS_DERIVED) {
                continue;
            }
            let value = self.backend.get_property(edge.end, props::DERIVED_VALUE).await?;
            if let Some(DerivedValue::Ready { value }) = value.as_ref().and_then(DerivedValue::from_property) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Targets of reference `name` on `node`.
    pub async fn references(&mut self, node: NodeId, name: &str) -> Result<Vec<NodeId>> {
        self.accesses.insert((node, name.to_string()));
        Ok(self
            .backend
            .edges(node, Direction::Outgoing, Some(name))
            .await?
            .into_iter()
            .filter(|e| !e.flag(props::IS_DERIVED))
            .map(|e| e.end)
            .collect())
    }

    pub fn accesses(&self) -> &BTreeSet<(NodeId, String)> {
        &self.accesses
    }

    pub(crate) fn into_accesses(self) -> BTreeSet<(NodeId, String)> {
        self.accesses
    }
}

/// Built-in evaluator for dotted paths: `name` reads an attribute of the
/// element, `owner.name` follows the `owner` reference first. A path that
/// reaches several elements yields a list.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttrEvaluator;

#[async_trait]
impl DerivedEvaluator for AttrEvaluator {
    fn language(&self) -> &str {
        ATTR_LANGUAGE
    }

    async fn evaluate(&self, expression: &str, ctx: &mut EvalContext<'_>) -> Result<PropertyValue> {
        let segments: Vec<&str> = expression.split('.').map(str::trim).collect();
        if segments.iter().any(|s| s.is_empty()) {
            bail!(IndexError::Evaluator {
                attribute: expression.to_string(),
                reason: "empty path segment".into(),
            });
        }
        let Some((attribute, path)) = segments.split_last() else {
            bail!(IndexError::Evaluator {
                attribute: expression.to_string(),
                reason: "empty expression".into(),
            });
        };

        let mut current = vec![ctx.element()];
        for reference in path {
            let mut next = Vec::new();
            for node in current {
                next.extend(ctx.references(node, reference).await?);
            }
            current = next;
        }

        let mut values = Vec::new();
        for node in current {
            if let Some(value) = ctx.attribute(node, attribute).await? {
                values.push(value);
            }
        }
        match values.len() {
            0 => bail!(IndexError::Evaluator {
                attribute: expression.to_string(),
                reason: "path yields no value".into(),
            }),
            1 => Ok(values.remove(0)),
            _ => Ok(PropertyValue::List(values)),
        }
    }
}

/// Evaluators keyed by language id.
#[derive(Clone)]
pub struct EvaluatorRegistry {
    evaluators: HashMap<String, Arc<dyn DerivedEvaluator>>,
}

impl EvaluatorRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    pub fn register(&mut self, evaluator: Arc<dyn DerivedEvaluator>) {
        self.evaluators
            .insert(evaluator.language().to_string(), evaluator);
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn DerivedEvaluator>> {
        self.evaluators.get(language).cloned()
    }

    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.evaluators.keys().cloned().collect();
        languages.sort();
        languages
    }
}

impl Default for EvaluatorRegistry {
    /// A registry holding the built-in `attr` evaluator.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(AttrEvaluator));
        registry
    }
}
