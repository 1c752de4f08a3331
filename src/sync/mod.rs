//! Synchronization
//!
//! The controller polls every monitored repository on a backoff schedule,
//! feeds changed artifacts through the updater, then resolves proxies and
//! recomputes derived attributes once per cycle.
//!
//! ## Modules
//!
//! - [`controller`]: cycle driver and the operator-facing API
//! - [`state`]: lifecycle state and poll delay

pub mod controller;
pub mod state;

pub use controller::{
    CycleReport, RepositoryReport, SyncController, SyncControllerBuilder, SyncSettings,
    UNKNOWN_REVISION,
};
pub use state::{Backoff, SyncState};
