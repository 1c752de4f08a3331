//! Named secondary indexes
//!
//! Each logical index is backed by two physical structures kept in sync on
//! every write:
//!
//! - an **exact** structure (`BTreeMap` field → ordered value → entities) that
//!   serves point lookups, numeric ranges and value iteration;
//! - a **tokenized** structure (field → trigram → values) that serves
//!   wildcard (`*`) prefix/suffix/infix queries.
//!
//! A query with field `*` fans out over every field ever indexed; a query
//! with the literal value `*` iterates every value of the field.

use crate::graph::model::{EdgeId, NodeId, PropertyValue};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Field name that fans a query out over every indexed field.
pub const ANY_FIELD: &str = "*";

const GRAM: usize = 3;
const START: char = '\u{1}';
const END: char = '\u{2}';

// ============================================================================
// Public types
// ============================================================================

/// An identity held by an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum IndexEntity {
    Node(NodeId),
    Edge(EdgeId),
}

impl IndexEntity {
    pub fn as_node(self) -> Option<NodeId> {
        match self {
            IndexEntity::Node(id) => Some(id),
            IndexEntity::Edge(_) => None,
        }
    }
}

impl From<NodeId> for IndexEntity {
    fn from(id: NodeId) -> Self {
        IndexEntity::Node(id)
    }
}

impl From<EdgeId> for IndexEntity {
    fn from(id: EdgeId) -> Self {
        IndexEntity::Edge(id)
    }
}

/// Query forms supported by every index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    /// Point lookup on the exact structure.
    Exact(PropertyValue),
    /// `*` anywhere in the pattern; `*` alone iterates every value.
    Wildcard(String),
    /// Numeric range with an inclusive/exclusive/unbounded side each.
    Range { from: Bound<f64>, to: Bound<f64> },
}

impl IndexQuery {
    /// Interpret user text: anything containing `*` is a wildcard query.
    pub fn parse(value: &str) -> Self {
        if value.contains('*') {
            IndexQuery::Wildcard(value.to_string())
        } else {
            IndexQuery::Exact(PropertyValue::String(value.to_string()))
        }
    }

    pub fn all() -> Self {
        IndexQuery::Wildcard("*".to_string())
    }

    pub fn between(from: f64, to: f64, from_inclusive: bool, to_inclusive: bool) -> Self {
        IndexQuery::Range {
            from: if from_inclusive {
                Bound::Included(from)
            } else {
                Bound::Excluded(from)
            },
            to: if to_inclusive {
                Bound::Included(to)
            } else {
                Bound::Excluded(to)
            },
        }
    }
}

// ============================================================================
// Exact structure keys
// ============================================================================

/// Ordered key of the exact structure. Booleans sort before numbers, numbers
/// before text; integers and floats share the numeric axis.
#[derive(Debug, Clone)]
enum IndexKey {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl IndexKey {
    fn of(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(b) => IndexKey::Bool(*b),
            PropertyValue::Int(i) => IndexKey::Number(*i as f64),
            PropertyValue::Float(f) => IndexKey::Number(*f),
            PropertyValue::String(s) => IndexKey::Text(s.clone()),
            other => IndexKey::Text(other.index_text()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IndexKey::Bool(_) => 0,
            IndexKey::Number(_) => 1,
            IndexKey::Text(_) => 2,
        }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Bool(a), IndexKey::Bool(b)) => a.cmp(b),
            (IndexKey::Number(a), IndexKey::Number(b)) => a.total_cmp(b),
            (IndexKey::Text(a), IndexKey::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

/// Source variant of an indexed scalar. `Int(1)`, `Float(1.0)` and
/// `String("1")` share index text, so bindings carry the variant to keep
/// removal of one from dropping the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum ValueTag {
    Bool,
    Int,
    Float,
    Text,
    Json,
}

impl ValueTag {
    fn of(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(_) => ValueTag::Bool,
            PropertyValue::Int(_) => ValueTag::Int,
            PropertyValue::Float(_) => ValueTag::Float,
            PropertyValue::String(_) | PropertyValue::List(_) => ValueTag::Text,
            PropertyValue::Json(_) => ValueTag::Json,
        }
    }
}

type Binding = (IndexEntity, ValueTag);

/// Bindings stored under one exact key, with the original value of each
/// variant so `values()` hands back what was indexed.
#[derive(Debug, Clone, Default)]
struct Posting {
    values: BTreeMap<ValueTag, PropertyValue>,
    bindings: BTreeSet<Binding>,
}

impl Posting {
    fn entities(&self) -> impl Iterator<Item = IndexEntity> + '_ {
        self.bindings.iter().map(|(entity, _)| *entity)
    }

    /// Drop bindings of `entity` (one variant, or all of them) and return
    /// the index text and variant of each dropped binding.
    fn unbind(&mut self, entity: IndexEntity, tag: Option<ValueTag>) -> Vec<(String, ValueTag)> {
        let dropped: Vec<Binding> = self
            .bindings
            .iter()
            .filter(|(e, t)| *e == entity && tag.map_or(true, |tag| tag == *t))
            .copied()
            .collect();
        let mut texts = Vec::with_capacity(dropped.len());
        for binding in dropped {
            self.bindings.remove(&binding);
            if let Some(value) = self.values.get(&binding.1) {
                texts.push((value.index_text(), binding.1));
            }
        }
        let live: BTreeSet<ValueTag> = self.bindings.iter().map(|(_, t)| *t).collect();
        self.values.retain(|t, _| live.contains(t));
        texts
    }
}

// ============================================================================
// Tokenized structure
// ============================================================================

#[derive(Debug, Clone, Default)]
struct TokenField {
    grams: HashMap<String, BTreeSet<String>>,
    values: BTreeMap<String, BTreeSet<Binding>>,
}

impl TokenField {
    fn add(&mut self, text: &str, binding: Binding) {
        let fresh = !self.values.contains_key(text);
        self.values
            .entry(text.to_string())
            .or_default()
            .insert(binding);
        if fresh {
            for gram in grams_of(&anchored(text, true, true)) {
                self.grams.entry(gram).or_default().insert(text.to_string());
            }
        }
    }

    fn remove(&mut self, text: &str, binding: Binding) {
        let emptied = match self.values.get_mut(text) {
            Some(bindings) => {
                bindings.remove(&binding);
                bindings.is_empty()
            }
            None => false,
        };
        if emptied {
            self.values.remove(text);
            for gram in grams_of(&anchored(text, true, true)) {
                if let Some(texts) = self.grams.get_mut(&gram) {
                    texts.remove(text);
                    if texts.is_empty() {
                        self.grams.remove(&gram);
                    }
                }
            }
        }
    }

    fn matching(&self, pattern: &str) -> Result<BTreeSet<IndexEntity>> {
        let regex = wildcard_regex(pattern)?;
        let grams = pattern_grams(pattern);

        let candidates: Vec<&String> = if grams.is_empty() {
            self.values.keys().collect()
        } else {
            let mut postings: Vec<&BTreeSet<String>> = Vec::with_capacity(grams.len());
            for gram in &grams {
                match self.grams.get(gram) {
                    Some(texts) => postings.push(texts),
                    None => return Ok(BTreeSet::new()),
                }
            }
            postings.sort_by_key(|p| p.len());
            postings[0]
                .iter()
                .filter(|text| postings[1..].iter().all(|p| p.contains(*text)))
                .collect()
        };

        let mut hits = BTreeSet::new();
        for text in candidates {
            if regex.is_match(text) {
                if let Some(bindings) = self.values.get(text) {
                    hits.extend(bindings.iter().map(|(entity, _)| *entity));
                }
            }
        }
        Ok(hits)
    }
}

fn anchored(text: &str, start: bool, end: bool) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    if start {
        out.push(START);
    }
    out.push_str(text);
    if end {
        out.push(END);
    }
    out
}

fn grams_of(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < GRAM {
        return Vec::new();
    }
    chars.windows(GRAM).map(|w| w.iter().collect()).collect()
}

/// Trigrams every matching value must contain. Empty when the literal
/// segments are too short to constrain anything.
fn pattern_grams(pattern: &str) -> BTreeSet<String> {
    let segments: Vec<&str> = pattern.split('*').collect();
    let last = segments.len() - 1;
    let mut grams = BTreeSet::new();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        let padded = anchored(segment, i == 0, i == last);
        grams.extend(grams_of(&padded));
    }
    grams
}

fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?s)^{}$", body))
        .with_context(|| format!("Invalid wildcard pattern: {}", pattern))
}

// ============================================================================
// Dual index
// ============================================================================

/// One logical index: exact + tokenized structures over the same entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "IndexSnapshot", from = "IndexSnapshot")]
pub struct DualIndex {
    exact: BTreeMap<String, BTreeMap<IndexKey, Posting>>,
    tokens: BTreeMap<String, TokenField>,
}

impl DualIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `entity` under `field = value`. Lists are indexed element-wise.
    pub fn add(&mut self, entity: IndexEntity, field: &str, value: &PropertyValue) {
        for scalar in value.scalars() {
            let tag = ValueTag::of(scalar);
            let posting = self
                .exact
                .entry(field.to_string())
                .or_default()
                .entry(IndexKey::of(scalar))
                .or_default();
            posting.values.entry(tag).or_insert_with(|| scalar.clone());
            posting.bindings.insert((entity, tag));
            self.tokens
                .entry(field.to_string())
                .or_default()
                .add(&scalar.index_text(), (entity, tag));
        }
    }

    /// Remove bindings of `entity`, optionally restricted to a field and a value.
    pub fn remove(&mut self, entity: IndexEntity, field: Option<&str>, value: Option<&PropertyValue>) {
        let fields: Vec<String> = match field {
            Some(f) if f != ANY_FIELD => vec![f.to_string()],
            _ => self.exact.keys().cloned().collect(),
        };

        for field in fields {
            let mut removed_texts = Vec::new();
            if let Some(keys) = self.exact.get_mut(&field) {
                let targets: Vec<(IndexKey, Option<ValueTag>)> = match value {
                    Some(v) => v
                        .scalars()
                        .into_iter()
                        .map(|s| (IndexKey::of(s), Some(ValueTag::of(s))))
                        .collect(),
                    None => keys
                        .iter()
                        .filter(|(_, p)| p.entities().any(|e| e == entity))
                        .map(|(k, _)| (k.clone(), None))
                        .collect(),
                };
                for (key, tag) in targets {
                    let emptied = match keys.get_mut(&key) {
                        Some(posting) => {
                            removed_texts.extend(posting.unbind(entity, tag));
                            posting.bindings.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        keys.remove(&key);
                    }
                }
                if keys.is_empty() {
                    self.exact.remove(&field);
                }
            }
            if let Some(token_field) = self.tokens.get_mut(&field) {
                for (text, tag) in &removed_texts {
                    token_field.remove(text, (entity, *tag));
                }
                if token_field.values.is_empty() {
                    self.tokens.remove(&field);
                }
            }
        }
    }

    /// Remove every binding of `entity`.
    pub fn remove_entity(&mut self, entity: IndexEntity) {
        self.remove(entity, None, None);
    }

    pub fn query(&self, field: &str, query: &IndexQuery) -> Result<BTreeSet<IndexEntity>> {
        let fields: Vec<&String> = if field == ANY_FIELD {
            self.exact.keys().collect()
        } else {
            self.exact.get_key_value(field).map(|(k, _)| k).into_iter().collect()
        };

        let mut hits = BTreeSet::new();
        for field in fields {
            match query {
                IndexQuery::Exact(value) => {
                    if let Some(posting) = self.exact[field].get(&IndexKey::of(value)) {
                        hits.extend(posting.entities());
                    }
                }
                IndexQuery::Wildcard(pattern) if pattern.chars().all(|c| c == '*') => {
                    for posting in self.exact[field].values() {
                        hits.extend(posting.entities());
                    }
                }
                IndexQuery::Wildcard(pattern) => {
                    if let Some(token_field) = self.tokens.get(field) {
                        hits.extend(token_field.matching(pattern)?);
                    }
                }
                IndexQuery::Range { from, to } => {
                    if is_nan(from) || is_nan(to) {
                        continue;
                    }
                    let lo = map_bound(*from);
                    let hi = map_bound(*to);
                    if range_is_empty(&lo, &hi) {
                        continue;
                    }
                    for (key, posting) in self.exact[field].range((lo, hi)) {
                        if matches!(key, IndexKey::Number(_)) {
                            hits.extend(posting.entities());
                        }
                    }
                }
            }
        }
        Ok(hits)
    }

    /// Every distinct value stored under a field (`*` for all fields).
    pub fn values(&self, field: &str) -> Vec<PropertyValue> {
        let mut out = Vec::new();
        for (name, keys) in &self.exact {
            if field == ANY_FIELD || name == field {
                out.extend(keys.values().flat_map(|p| p.values.values().cloned()));
            }
        }
        out
    }

    pub fn fields(&self) -> Vec<String> {
        self.exact.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Number of (field, value, entity) bindings.
    pub fn len(&self) -> usize {
        self.exact
            .values()
            .flat_map(|keys| keys.values())
            .map(|p| p.bindings.len())
            .sum()
    }
}

fn map_bound(bound: Bound<f64>) -> Bound<IndexKey> {
    match bound {
        Bound::Included(v) => Bound::Included(IndexKey::Number(v)),
        Bound::Excluded(v) => Bound::Excluded(IndexKey::Number(v)),
        // Non-numeric keys reached through an unbounded side are filtered by the caller.
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn is_nan(bound: &Bound<f64>) -> bool {
    matches!(bound, Bound::Included(v) | Bound::Excluded(v) if v.is_nan())
}

/// `BTreeMap::range` panics on inverted or degenerate-exclusive bounds.
/// Compared in key order, where `-0.0 < 0.0`.
fn range_is_empty(from: &Bound<IndexKey>, to: &Bound<IndexKey>) -> bool {
    match (from, to) {
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
        _ => false,
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Flat entry list used to persist an index; both structures are rebuilt
/// from it on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexSnapshot {
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    field: String,
    value: PropertyValue,
    entity: IndexEntity,
}

impl From<DualIndex> for IndexSnapshot {
    fn from(index: DualIndex) -> Self {
        let mut entries = Vec::with_capacity(index.len());
        for (field, keys) in index.exact {
            for posting in keys.into_values() {
                for (entity, tag) in posting.bindings {
                    if let Some(value) = posting.values.get(&tag) {
                        entries.push(IndexEntry {
                            field: field.clone(),
                            value: value.clone(),
                            entity,
                        });
                    }
                }
            }
        }
        IndexSnapshot { entries }
    }
}

impl From<IndexSnapshot> for DualIndex {
    fn from(snapshot: IndexSnapshot) -> Self {
        let mut index = DualIndex::new();
        for entry in snapshot.entries {
            index.add(entry.entity, &entry.field, &entry.value);
        }
        index
    }
}
