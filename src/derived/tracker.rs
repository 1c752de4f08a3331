//! Dirty derived-attribute tracker
//!
//! Passive listener recording which `(element, key)` pairs changed during a
//! cycle. `*` stands for "everything about this element". Entries recorded
//! during an artifact update that later fails are discarded.

use crate::events::{ChangeListener, GraphChange, SyncEvent};
use crate::graph::model::NodeId;
use anyhow::Result;
use parking_lot::Mutex;

/// Key meaning every attribute of an element.
pub const ALL_KEYS: &str = "*";

#[derive(Default)]
struct Pending {
    entries: Vec<(NodeId, String)>,
    checkpoint: usize,
}

#[derive(Default)]
pub struct DirtyDerivedTracker {
    pending: Mutex<Pending>,
}

impl DirtyDerivedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, element: NodeId, key: &str) {
        self.pending.lock().entries.push((element, key.to_string()));
    }

    /// Drain the recorded entries.
    pub fn take_pending(&self) -> Vec<(NodeId, String)> {
        let mut pending = self.pending.lock();
        pending.checkpoint = 0;
        std::mem::take(&mut pending.entries)
    }

    /// Put drained entries back ahead of anything recorded since.
    pub fn requeue(&self, entries: Vec<(NodeId, String)>) {
        let mut pending = self.pending.lock();
        pending.checkpoint += entries.len();
        pending.entries.splice(0..0, entries);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().entries.len()
    }
}

impl ChangeListener for DirtyDerivedTracker {
    fn name(&self) -> &str {
        "dirty-derived-tracker"
    }

    fn on_change(&self, change: &GraphChange) -> Result<()> {
        if change.is_transient() {
            return Ok(());
        }
        match change {
            GraphChange::ElementAdded { element, .. } | GraphChange::ElementRemoved { element, .. } => {
                self.record(*element, ALL_KEYS)
            }
            GraphChange::AttributeUpdated {
                element, attribute, ..
            }
            | GraphChange::AttributeRemoved {
                element, attribute, ..
            } => self.record(*element, attribute),
            GraphChange::ReferenceAdded { source, label, .. }
            | GraphChange::ReferenceRemoved { source, label, .. } => self.record(*source, label),
            _ => {}
        }
        Ok(())
    }

    fn on_sync_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::ChangeStart { .. } => {
                let mut pending = self.pending.lock();
                pending.checkpoint = pending.entries.len();
            }
            SyncEvent::ChangeFailure { .. } => {
                let mut pending = self.pending.lock();
                let checkpoint = pending.checkpoint;
                pending.entries.truncate(checkpoint);
            }
            _ => {}
        }
    }
}
