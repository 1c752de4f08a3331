//! Change notification types

use crate::graph::model::{NodeId, PropertyValue};
use crate::sync::SyncState;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A graph mutation performed by the engine.
///
/// `transient` marks changes that are a consequence of bookkeeping (derived
/// value writes) rather than of artifact content; the dirty tracker ignores
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum GraphChange {
    FileAdded {
        file: NodeId,
        repository: String,
        path: String,
    },
    FileRemoved {
        file: NodeId,
        repository: String,
        path: String,
    },
    ElementAdded {
        element: NodeId,
        type_name: String,
        transient: bool,
    },
    ElementRemoved {
        element: NodeId,
        transient: bool,
    },
    AttributeUpdated {
        element: NodeId,
        attribute: String,
        value: PropertyValue,
        transient: bool,
    },
    AttributeRemoved {
        element: NodeId,
        attribute: String,
        transient: bool,
    },
    ReferenceAdded {
        source: NodeId,
        target: NodeId,
        label: String,
        transient: bool,
    },
    ReferenceRemoved {
        source: NodeId,
        target: NodeId,
        label: String,
        transient: bool,
    },
    MetamodelAdded {
        uri: String,
    },
    MetamodelRemoved {
        uri: String,
    },
}

impl GraphChange {
    pub fn is_transient(&self) -> bool {
        match self {
            GraphChange::ElementAdded { transient, .. }
            | GraphChange::ElementRemoved { transient, .. }
            | GraphChange::AttributeUpdated { transient, .. }
            | GraphChange::AttributeRemoved { transient, .. }
            | GraphChange::ReferenceAdded { transient, .. }
            | GraphChange::ReferenceRemoved { transient, .. } => *transient,
            _ => false,
        }
    }
}

/// Lifecycle notification of the synchronization controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStart,
    SyncEnd,
    /// One artifact's update begins.
    ChangeStart { repository: String, path: String },
    ChangeSuccess { repository: String, path: String },
    /// The artifact's update was aborted; its mutations were undone.
    ChangeFailure {
        repository: String,
        path: String,
        reason: String,
    },
    StateChanged { from: SyncState, to: SyncState },
    Progress { message: String },
}

/// Receives ordered notifications from inside the mutating task.
///
/// Listeners run synchronously in registration order. An error from
/// `on_change` aborts the current artifact's update.
pub trait ChangeListener: Send + Sync {
    /// Name used in logs and listener errors.
    fn name(&self) -> &str;

    fn on_change(&self, change: &GraphChange) -> Result<()>;

    fn on_sync_event(&self, _event: &SyncEvent) {}
}
