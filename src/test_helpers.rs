//! Test helper factories and fake collaborators
//!
//! Provides a small architecture metamodel, element builders, and an
//! in-memory repository whose content tests script directly.
#![allow(dead_code)]

use crate::derived::{AttrEvaluator, DerivedEvaluator, EvalContext, ATTR_LANGUAGE};
use crate::events::{ChangeListener, GraphChange, SyncEvent};
use crate::graph::{GraphBackend, InMemoryBackend, PropertyValue};
use crate::model::{
    AttributeDef, DerivedAttributeSpec, DerivedDef, FeatureDef, Metamodel, MetamodelRegistry,
    ParsedElement, ReferenceDef, TypeDef, TypeRef,
};
use crate::repository::{diff_listings, full_delta, Artifact, Delta, Listing, RepositoryManager};
use crate::updater::GraphUpdater;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const ARCH_URI: &str = "urn:arch";

// ============================================================================
// Metamodel and elements
// ============================================================================

fn attribute(name: &str, many: bool) -> FeatureDef {
    FeatureDef::Attribute(AttributeDef {
        name: name.to_string(),
        data_type: None,
        many,
        ordered: false,
        unique: false,
    })
}

fn reference(name: &str, many: bool, containment: bool) -> FeatureDef {
    FeatureDef::Reference(ReferenceDef {
        name: name.to_string(),
        target_type: None,
        many,
        containment,
        container: false,
    })
}

fn type_def(name: &str, supertypes: &[&str], features: Vec<FeatureDef>, singleton: bool) -> TypeDef {
    TypeDef {
        name: name.to_string(),
        supertypes: supertypes.iter().map(|s| s.to_string()).collect(),
        features,
        singleton,
    }
}

/// `Named` <- `Component`, `Connector`; `Library` is a singleton.
pub fn sample_metamodel() -> Metamodel {
    Metamodel {
        uri: ARCH_URI.to_string(),
        depends_on: Vec::new(),
        types: vec![
            type_def("Named", &[], vec![attribute("name", false)], false),
            type_def(
                "Component",
                &["Named"],
                vec![
                    attribute("size", false),
                    attribute("tags", true),
                    reference("parts", true, true),
                    reference("uses", true, false),
                ],
                false,
            ),
            type_def(
                "Connector",
                &["Named"],
                vec![reference("source", false, false), reference("target", false, false)],
                false,
            ),
            type_def("Library", &[], vec![attribute("name", false)], true),
        ],
    }
}

pub fn arch_element(id: &str, type_name: &str) -> ParsedElement {
    ParsedElement::new(id, TypeRef::new(ARCH_URI, type_name))
}

pub fn component(id: &str, name: &str) -> ParsedElement {
    arch_element(id, "Component").with_attribute("name", name)
}

pub fn library(id: &str, name: &str) -> ParsedElement {
    arch_element(id, "Library").with_attribute("name", name)
}

/// `Component.label`, a copy of the component's name.
pub fn label_spec() -> DerivedAttributeSpec {
    DerivedAttributeSpec {
        metamodel: ARCH_URI.to_string(),
        type_name: "Component".to_string(),
        attribute: DerivedDef {
            name: "label".to_string(),
            data_type: None,
            many: false,
            ordered: false,
            unique: false,
            language: crate::derived::ATTR_LANGUAGE.to_string(),
            expression: "name".to_string(),
        },
    }
}

/// Backend with the sample metamodel committed, and an updater without
/// listeners.
pub async fn indexed_updater() -> (Arc<InMemoryBackend>, GraphUpdater) {
    let backend = Arc::new(InMemoryBackend::new());
    backend.begin_transaction().await.expect("begin");
    MetamodelRegistry::new(backend.clone())
        .register(&[sample_metamodel()])
        .await
        .expect("register sample metamodel");
    backend.commit().await.expect("commit");
    let updater = GraphUpdater::new(backend.clone(), Arc::new(Default::default()));
    (backend, updater)
}

fn plain(value: &PropertyValue) -> serde_json::Value {
    match value {
        PropertyValue::Bool(b) => serde_json::json!(b),
        PropertyValue::Int(i) => serde_json::json!(i),
        PropertyValue::Float(f) => serde_json::json!(f),
        PropertyValue::String(s) => serde_json::json!(s),
        PropertyValue::List(items) => items.iter().map(plain).collect(),
        PropertyValue::Json(json) => json.clone(),
    }
}

/// Render elements in the JSON model artifact format.
pub fn artifact_json(elements: &[ParsedElement]) -> String {
    let elements: Vec<serde_json::Value> = elements
        .iter()
        .map(|e| {
            let attributes: serde_json::Map<String, serde_json::Value> = e
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), plain(v)))
                .collect();
            serde_json::json!({
                "id": e.id,
                "type": e.type_ref,
                "attributes": attributes,
                "references": e.references,
            })
        })
        .collect();
    serde_json::json!({ "elements": elements }).to_string()
}

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct ScriptedState {
    files: BTreeMap<String, String>,
    history: HashMap<String, Arc<Listing>>,
    failing: bool,
}

/// Repository backed by a map the test edits between cycles.
pub struct ScriptedRepository {
    location: String,
    state: Mutex<ScriptedState>,
}

impl ScriptedRepository {
    pub fn new(location: &str) -> Arc<Self> {
        Arc::new(Self {
            location: location.to_string(),
            state: Mutex::new(ScriptedState::default()),
        })
    }

    pub fn put(&self, path: &str, content: impl Into<String>) {
        self.state.lock().files.insert(path.to_string(), content.into());
    }

    pub fn remove(&self, path: &str) {
        self.state.lock().files.remove(path);
    }

    /// Make revision and delta requests fail.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    fn snapshot(state: &mut ScriptedState) -> (String, Arc<Listing>) {
        let listing: Listing = state
            .files
            .iter()
            .map(|(path, content)| (path.clone(), hex::encode(Sha256::digest(content.as_bytes()))))
            .collect();
        let mut hasher = Sha256::new();
        for (path, digest) in &listing {
            hasher.update(format!("{}\0{}\n", path, digest));
        }
        let revision = hex::encode(hasher.finalize());
        let listing = Arc::new(listing);
        state.history.insert(revision.clone(), listing.clone());
        (revision, listing)
    }
}

#[async_trait]
impl RepositoryManager for ScriptedRepository {
    fn location(&self) -> &str {
        &self.location
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn current_revision(&self) -> Result<String> {
        let mut state = self.state.lock();
        if state.failing {
            bail!("connection refused");
        }
        Ok(Self::snapshot(&mut state).0)
    }

    async fn delta(&self, since: Option<&str>) -> Result<Delta> {
        let mut state = self.state.lock();
        if state.failing {
            bail!("connection refused");
        }
        let previous = since.and_then(|s| state.history.get(s).cloned());
        let (_, current) = Self::snapshot(&mut state);
        Ok(match previous {
            Some(previous) => diff_listings(&previous, &current),
            None => full_delta(&current),
        })
    }

    async fn import_file(&self, revision: &str, path: &str) -> Result<Artifact> {
        let state = self.state.lock();
        let content = state
            .files
            .get(path)
            .ok_or_else(|| anyhow!("{} not found", path))?;
        Ok(Artifact {
            path: path.to_string(),
            revision: revision.to_string(),
            content: content.as_bytes().to_vec(),
        })
    }
}

/// The `attr` evaluator, counting how often it runs.
#[derive(Default)]
pub struct CountingEvaluator {
    calls: AtomicUsize,
}

impl CountingEvaluator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DerivedEvaluator for CountingEvaluator {
    fn language(&self) -> &str {
        ATTR_LANGUAGE
    }

    async fn evaluate(&self, expression: &str, ctx: &mut EvalContext<'_>) -> Result<PropertyValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        AttrEvaluator.evaluate(expression, ctx).await
    }
}

/// Records every sync event it sees.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }
}

impl ChangeListener for RecordingListener {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_change(&self, _change: &GraphChange) -> Result<()> {
        Ok(())
    }

    fn on_sync_event(&self, event: &SyncEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Fails on `ReferenceAdded` while rejecting.
#[derive(Default)]
pub struct RejectingListener {
    rejecting: AtomicBool,
}

impl RejectingListener {
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

impl ChangeListener for RejectingListener {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn on_change(&self, change: &GraphChange) -> Result<()> {
        if self.rejecting.load(Ordering::SeqCst) && matches!(change, GraphChange::ReferenceAdded { .. }) {
            bail!("reference rejected");
        }
        Ok(())
    }
}
