//! Controller lifecycle state and poll scheduling

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// `Stopped -> Running <-> Updating -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Stopped,
    Running,
    Updating,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Stopped => "stopped",
            SyncState::Running => "running",
            SyncState::Updating => "updating",
        };
        f.write_str(name)
    }
}

/// Poll delay: doubles while nothing changes, capped at `max`, and drops
/// back to `min` as soon as a cycle sees a change. The floor is never below
/// [`MIN_DELAY_FLOOR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

/// Smallest poll delay; a zero delay would spin the sync loop.
pub const MIN_DELAY_FLOOR: Duration = Duration::from_millis(1);

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(MIN_DELAY_FLOOR);
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn on_no_change(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    pub fn on_change(&mut self) -> Duration {
        self.current = self.min;
        self.current
    }
}
