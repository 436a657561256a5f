//! Supervising daemon that keeps the scheduler process alive.

pub mod daemon;
pub mod state;

pub use daemon::{SupervisingDaemon, SupervisorOptions};
pub use state::{Backoff, DaemonState, DaemonStatus, StateWriter};

/// Errors from the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to persist daemon state: {0}")]
    State(#[from] fleet_core::Error),
}
