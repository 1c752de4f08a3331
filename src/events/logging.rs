//! Listener that turns lifecycle events into log lines.

use super::types::{ChangeListener, GraphChange, SyncEvent};
use anyhow::Result;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl ChangeListener for LoggingListener {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_change(&self, change: &GraphChange) -> Result<()> {
        trace!(?change, "Graph change");
        Ok(())
    }

    fn on_sync_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::SyncStart => info!("Synchronization started"),
            SyncEvent::SyncEnd => info!("Synchronization finished"),
            SyncEvent::ChangeStart { repository, path } => {
                debug!(repository = %repository, path = %path, "Updating artifact")
            }
            SyncEvent::ChangeSuccess { repository, path } => {
                debug!(repository = %repository, path = %path, "Artifact updated")
            }
            SyncEvent::ChangeFailure {
                repository,
                path,
                reason,
            } => warn!(repository = %repository, path = %path, "Artifact update failed: {}", reason),
            SyncEvent::StateChanged { from, to } => info!("State {:?} -> {:?}", from, to),
            SyncEvent::Progress { message } => info!("{}", message),
        }
    }
}
