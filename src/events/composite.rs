//! Fan-out listener
//!
//! One `CompositeListener` is built at startup and injected into the updater,
//! the derived-attribute manager and the synchronization controller. It
//! forwards every notification to its members in registration order.

use super::types::{ChangeListener, GraphChange, SyncEvent};
use crate::error::IndexError;
use anyhow::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Default)]
pub struct CompositeListener {
    members: RwLock<Vec<(Uuid, Arc<dyn ChangeListener>)>>,
}

impl CompositeListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; the returned id removes it again.
    pub fn add(&self, listener: Arc<dyn ChangeListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.members.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut members = self.members.write();
        let before = members.len();
        members.retain(|(member, _)| *member != id);
        members.len() != before
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    // Members are snapshotted so a listener may (de)register others while
    // being notified.
    fn snapshot(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.members.read().iter().map(|(_, l)| l.clone()).collect()
    }

    /// Forward a graph change; stops at the first listener that fails.
    pub fn notify(&self, change: &GraphChange) -> Result<()> {
        for listener in self.snapshot() {
            if let Err(e) = listener.on_change(change) {
                warn!(listener = listener.name(), "Listener rejected change: {:#}", e);
                return Err(IndexError::Listener {
                    listener: listener.name().to_string(),
                    reason: format!("{:#}", e),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn sync_event(&self, event: &SyncEvent) {
        for listener in self.snapshot() {
            listener.on_sync_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::NodeId;
    use parking_lot::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl ChangeListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_change(&self, _change: &GraphChange) -> Result<()> {
            self.log.lock().push(self.name.clone());
            if self.fail {
                anyhow::bail!("refused");
            }
            Ok(())
        }

        fn on_sync_event(&self, _event: &SyncEvent) {
            self.log.lock().push(format!("{}:event", self.name));
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<dyn ChangeListener> {
        Arc::new(Recorder {
            name: name.into(),
            log: log.clone(),
            fail,
        })
    }

    fn change() -> GraphChange {
        GraphChange::ElementRemoved {
            element: NodeId(1),
            transient: false,
        }
    }

    #[test]
    fn test_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeListener::new();
        composite.add(recorder("a", &log, false));
        composite.add(recorder("b", &log, false));

        composite.notify(&change()).unwrap();
        composite.sync_event(&SyncEvent::SyncStart);
        assert_eq!(*log.lock(), vec!["a", "b", "a:event", "b:event"]);
    }

    #[test]
    fn test_failure_stops_fan_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeListener::new();
        composite.add(recorder("a", &log, true));
        composite.add(recorder("b", &log, false));

        let err = composite.notify(&change()).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(IndexError::Listener { listener, .. }) if listener == "a"
        ));
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn test_remove_listener() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeListener::new();
        let id = composite.add(recorder("a", &log, false));
        assert!(composite.remove(id));
        assert!(!composite.remove(id));
        assert!(composite.is_empty());
    }
}
