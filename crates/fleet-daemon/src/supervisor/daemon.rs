//! Supervising daemon: keeps one child process alive.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use fleet_core::Config;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::SupervisorError;
use super::state::{Backoff, DaemonState, DaemonStatus, StateWriter};
use crate::process;

/// How the supervisor launches and restarts its child.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub state_path: PathBuf,
    pub stop_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub stable_after: Duration,
}

impl SupervisorOptions {
    /// Options from configuration. `default_command` is used when the config
    /// names no child program.
    pub fn from_config(config: &Config, default_command: PathBuf) -> Self {
        let daemon = &config.daemon;
        Self {
            command: daemon.child_command.clone().unwrap_or(default_command),
            args: daemon.child_args.clone(),
            state_path: config.daemon_state_path(),
            stop_timeout: Duration::from_secs(daemon.stop_timeout_secs),
            backoff_initial: Duration::from_millis(daemon.restart_backoff_initial_ms),
            backoff_max: Duration::from_millis(daemon.restart_backoff_max_ms),
            stable_after: Duration::from_secs(daemon.stable_after_secs),
        }
    }
}

/// Restarts its child on every exit it did not ask for.
pub struct SupervisingDaemon {
    options: SupervisorOptions,
    writer: StateWriter,
    backoff: Backoff,
}

impl SupervisingDaemon {
    pub fn new(options: SupervisorOptions) -> Self {
        let writer = StateWriter::new(options.state_path.clone());
        let backoff = Backoff::new(options.backoff_initial, options.backoff_max);
        Self {
            options,
            writer,
            backoff,
        }
    }

    /// Supervise until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Returns the final persisted state. Failed state writes along the way
    /// are logged; only the last one, recording `Stopped`, is returned as an
    /// error.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<DaemonState, SupervisorError> {
        info!(
            command = %self.options.command.display(),
            args = ?self.options.args,
            state = %self.options.state_path.display(),
            "Supervisor starting"
        );

        while !*shutdown.borrow() {
            self.record(DaemonStatus::Starting, None);

            let mut child = match self.spawn_child() {
                Ok(child) => child,
                Err(e) => {
                    error!(error = %e, "Failed to spawn supervised child");
                    self.record_crash();
                    if self.wait_backoff(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let pid = child.id();
            self.record(DaemonStatus::Running, pid);
            info!(?pid, restart_count = self.writer.state().restart_count, "Child running");
            let started = Instant::now();

            tokio::select! {
                status = child.wait() => {
                    let uptime = started.elapsed();
                    match status {
                        Ok(status) => warn!(?pid, ?status, ?uptime, "Child exited unexpectedly"),
                        Err(e) => warn!(?pid, error = %e, "Error waiting for child"),
                    }
                    if uptime >= self.options.stable_after {
                        self.backoff.reset();
                    }
                    self.record_crash();
                    if self.wait_backoff(&mut shutdown).await {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    self.record(DaemonStatus::Stopping, pid);
                    info!(?pid, "Stopping child");
                    let code = process::terminate_child(&mut child, self.options.stop_timeout).await;
                    info!(?pid, ?code, "Child stopped");
                    break;
                }
            }
        }

        self.writer.transition(DaemonStatus::Stopped, None)?;
        info!(restart_count = self.writer.state().restart_count, "Supervisor stopped");
        Ok(self.writer.state().clone())
    }

    fn record(&mut self, status: DaemonStatus, pid: Option<u32>) {
        if let Err(e) = self.writer.transition(status, pid) {
            error!(?status, error = %e, "Failed to persist daemon state");
        }
    }

    fn record_crash(&mut self) {
        if let Err(e) = self.writer.crashed() {
            error!(
                restart_count = self.writer.state().restart_count,
                error = %e,
                "Failed to persist daemon crash"
            );
        }
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        Command::new(&self.options.command)
            .args(&self.options.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }

    /// Sleep the backoff delay. Returns `true` if shutdown was requested meanwhile.
    async fn wait_backoff(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.backoff.next_delay();
        info!(?delay, "Restarting child after backoff");
        tokio::select! {
            () = tokio::time::sleep(delay) => *shutdown.borrow(),
            _ = shutdown.changed() => true,
        }
    }
}
