//! Change notification system
//!
//! This module provides:
//! - `GraphChange` / `SyncEvent`: ordered notifications emitted while indexing
//! - `ChangeListener`: the listener contract (dirty tracker, observers)
//! - `CompositeListener`: fan-out over registered listeners
//! - `EventBus`: broadcast channel re-publishing lifecycle events
//! - `LoggingListener`: lifecycle events as log lines

mod bus;
mod composite;
mod logging;
mod types;

pub use bus::{EventBus, SyncNotification};
pub use composite::CompositeListener;
pub use logging::LoggingListener;
pub use types::{ChangeListener, GraphChange, SyncEvent};
