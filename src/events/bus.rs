//! Event bus for broadcasting lifecycle notifications to external observers

use super::types::{ChangeListener, GraphChange, SyncEvent};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Default broadcast channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// A lifecycle event stamped for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncNotification {
    pub id: Uuid,
    pub event: SyncEvent,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl SyncNotification {
    pub fn new(event: SyncEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Event bus that re-publishes `SyncEvent`s via `tokio::sync::broadcast`
///
/// Fire-and-forget: emitting never blocks, never panics.
/// If no subscribers are connected, events are silently dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncNotification>,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.sender.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Ok(n) = self.sender.send(SyncNotification::new(event)) {
            debug!(subscribers = n, "SyncEvent emitted");
        }
        // No subscribers is expected and fine
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeListener for EventBus {
    fn name(&self) -> &str {
        "event-bus"
    }

    fn on_change(&self, _change: &GraphChange) -> Result<()> {
        Ok(())
    }

    fn on_sync_event(&self, event: &SyncEvent) {
        self.emit(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncState;

    #[test]
    fn test_emit_without_subscriber_no_panic() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::SyncStart);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_multi_subscribers() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.on_sync_event(&SyncEvent::StateChanged {
            from: SyncState::Running,
            to: SyncState::Updating,
        });

        let e1 = rx1.try_recv().unwrap();
        let e2 = rx2.try_recv().unwrap();
        assert_eq!(e1.id, e2.id);
        assert!(matches!(
            e1.event,
            SyncEvent::StateChanged {
                to: SyncState::Updating,
                ..
            }
        ));
    }

    #[test]
    fn test_clone_shares_channel() {
        let bus = EventBus::default();
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.emit(SyncEvent::Progress {
            message: "indexed 3 artifacts".into(),
        });

        let notification = rx.try_recv().unwrap();
        assert!(matches!(notification.event, SyncEvent::Progress { .. }));
        assert!(!notification.timestamp.is_empty());
    }
}
