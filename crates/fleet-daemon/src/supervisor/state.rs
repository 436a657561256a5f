//! Persisted liveness state of the supervised child.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::persist;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    Starting,
    Running,
    Crashed,
    Stopping,
    Stopped,
}

/// Contents of the daemon state file.
///
/// `pid` is set while the child is running or being stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub pid: Option<u32>,
    pub status: DaemonStatus,
    pub restart_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl DaemonState {
    /// Read the state file written by a supervisor, if any.
    pub fn read(path: &Path) -> fleet_core::Result<Option<Self>> {
        persist::read_json(path)
    }
}

/// Single writer for the state file.
pub struct StateWriter {
    path: PathBuf,
    state: DaemonState,
}

impl StateWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: DaemonState {
                pid: None,
                status: DaemonStatus::Stopped,
                restart_count: 0,
                updated_at: Utc::now(),
            },
        }
    }

    pub const fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Move to `status` with `pid` and persist.
    pub fn transition(&mut self, status: DaemonStatus, pid: Option<u32>) -> fleet_core::Result<()> {
        self.state.status = status;
        self.state.pid = pid;
        self.state.updated_at = Utc::now();
        debug!(?status, ?pid, restart_count = self.state.restart_count, "Daemon state");
        persist::write_json_atomic(&self.path, &self.state)
    }

    /// Record an unexpected exit.
    pub fn crashed(&mut self) -> fleet_core::Result<()> {
        self.state.restart_count += 1;
        self.transition(DaemonStatus::Crashed, None)
    }
}

/// Exponential restart delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to use now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub const fn reset(&mut self) {
        self.current = self.initial;
    }
}
