//! Sub-agent process pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::LaunchTemplate;
use fleet_core::config::AgentConfig;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::context::AgentContext;
use crate::process;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No launch template for role '{role}'")]
    UnknownTemplate { role: String },

    #[error("Failed to spawn '{role}' agent: {reason}")]
    SpawnFailed { role: String, reason: String },

    #[error("Agent not found: {id}")]
    NotFound { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Terminated,
    Failed,
}

/// Snapshot of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub role: String,
    pub tenant: Option<String>,
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub exit_code: Option<i32>,
    pub spawned_at: DateTime<Utc>,
    /// Time since the agent last wrote to stdout (or was spawned).
    pub idle: Duration,
}

/// Identity of a freshly spawned agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedAgent {
    pub id: String,
    pub pid: Option<u32>,
}

struct AgentEntry {
    role: String,
    tenant: Option<String>,
    pid: Option<u32>,
    status: AgentStatus,
    exit_code: Option<i32>,
    spawned_at: DateTime<Utc>,
    last_activity: Instant,
    terminate_requested: bool,
    exited: bool,
    ended_at: Option<Instant>,
}

impl AgentEntry {
    fn record(&self, id: &str) -> AgentRecord {
        AgentRecord {
            id: id.to_string(),
            role: self.role.clone(),
            tenant: self.tenant.clone(),
            pid: self.pid,
            status: self.status,
            exit_code: self.exit_code,
            spawned_at: self.spawned_at,
            idle: self.last_activity.elapsed(),
        }
    }
}

type AgentMap = Arc<RwLock<HashMap<String, AgentEntry>>>;

/// Records of exited agents are kept this long unless configured otherwise.
const DEFAULT_RETAIN_ENDED: Duration = Duration::from_secs(600);

/// Spawns and tracks sub-agent processes from launch templates.
///
/// Records of agents whose process has exited are dropped once they are
/// older than the retention period.
pub struct AgentPool {
    templates: BTreeMap<String, LaunchTemplate>,
    terminate_timeout: Duration,
    retain_ended: Duration,
    agents: AgentMap,
}

impl AgentPool {
    pub fn new(templates: BTreeMap<String, LaunchTemplate>, terminate_timeout: Duration) -> Self {
        Self {
            templates,
            terminate_timeout,
            retain_ended: DEFAULT_RETAIN_ENDED,
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.templates.clone(),
            Duration::from_secs(config.terminate_timeout_secs),
        )
        .with_retention(Duration::from_secs(config.retain_ended_secs))
    }

    #[must_use]
    pub const fn with_retention(mut self, retain_ended: Duration) -> Self {
        self.retain_ended = retain_ended;
        self
    }

    pub const fn terminate_timeout(&self) -> Duration {
        self.terminate_timeout
    }

    /// Roles that have a launch template.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Start an agent for `role` with `context`.
    pub async fn spawn(&self, role: &str, context: &AgentContext) -> Result<SpawnedAgent, PoolError> {
        let template = self
            .templates
            .get(role)
            .ok_or_else(|| PoolError::UnknownTemplate {
                role: role.to_string(),
            })?;
        self.prune_ended().await;

        let id = uuid::Uuid::new_v4().to_string();
        let mut cmd = process::command_from_template(template, &context.template_vars(&id, role));
        cmd.envs(context.env_vars(&id, role));

        info!(agent_id = %id, role, tenant = ?context.tenant, command = %template.command, "Spawning agent");
        let mut child = cmd.spawn().map_err(|e| PoolError::SpawnFailed {
            role: role.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{}\n", context.to_json());
            let agent_id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!(agent_id = %agent_id, error = %e, "Failed to write agent context");
                }
            });
        }

        self.agents.write().await.insert(
            id.clone(),
            AgentEntry {
                role: role.to_string(),
                tenant: context.tenant.clone(),
                pid,
                status: AgentStatus::Active,
                exit_code: None,
                spawned_at: Utc::now(),
                last_activity: Instant::now(),
                terminate_requested: false,
                exited: false,
                ended_at: None,
            },
        );

        if let Some(stdout) = child.stdout.take() {
            let agents = Arc::clone(&self.agents);
            let agent_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(agent_id = %agent_id, "stdout: {}", line);
                    if let Some(entry) = agents.write().await.get_mut(&agent_id) {
                        entry.last_activity = Instant::now();
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            process::forward_stderr(stderr, format!("agent:{id}"));
        }

        let agents = Arc::clone(&self.agents);
        let agent_id = id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Error waiting for agent");
                    None
                }
            };
            let mut agents = agents.write().await;
            if let Some(entry) = agents.get_mut(&agent_id) {
                entry.exited = true;
                entry.ended_at = Some(Instant::now());
                entry.exit_code = code;
                entry.status = reconcile_exit(code, entry.terminate_requested);
                info!(agent_id = %agent_id, ?code, status = ?entry.status, "Agent exited");
            }
        });

        Ok(SpawnedAgent { id, pid })
    }

    /// Mark `id` terminated and stop its process.
    ///
    /// SIGTERM is sent now; a background task force-kills the process if it
    /// is still running after the terminate timeout. Terminating an agent
    /// that is no longer active does nothing.
    pub async fn terminate(&self, id: &str) -> Result<(), PoolError> {
        let pid = {
            let mut agents = self.agents.write().await;
            let entry = agents.get_mut(id).ok_or_else(|| PoolError::NotFound { id: id.to_string() })?;
            if entry.status != AgentStatus::Active {
                return Ok(());
            }
            entry.status = AgentStatus::Terminated;
            entry.terminate_requested = true;
            entry.pid
        };

        let Some(pid) = pid else { return Ok(()) };
        info!(agent_id = %id, pid, "Terminating agent");
        process::request_terminate(pid);

        let agents = Arc::clone(&self.agents);
        let agent_id = id.to_string();
        let grace = self.terminate_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = agents
                .read()
                .await
                .get(&agent_id)
                .is_some_and(|e| !e.exited);
            if still_running {
                warn!(agent_id = %agent_id, pid, "Agent ignored SIGTERM, killing");
                process::force_kill(pid);
            }
        });
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(id).map(|e| e.record(id))
    }

    pub async fn status(&self, id: &str) -> Option<AgentStatus> {
        self.agents.read().await.get(id).map(|e| e.status)
    }

    /// Agents that are still active, oldest first.
    pub async fn list_active(&self) -> Vec<AgentRecord> {
        let mut records: Vec<_> = self
            .agents
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.status == AgentStatus::Active)
            .map(|(id, e)| e.record(id))
            .collect();
        records.sort_by_key(|r| r.spawned_at);
        records
    }

    /// Every agent this pool has spawned, oldest first.
    pub async fn list_all(&self) -> Vec<AgentRecord> {
        let mut records: Vec<_> = self
            .agents
            .read()
            .await
            .iter()
            .map(|(id, e)| e.record(id))
            .collect();
        records.sort_by_key(|r| r.spawned_at);
        records
    }

    /// Drop records of agents that exited longer ago than the retention
    /// period. Returns how many were dropped.
    pub async fn prune_ended(&self) -> usize {
        let retain = self.retain_ended;
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|_, e| e.ended_at.is_none_or(|at| at.elapsed() < retain));
        let pruned = before - agents.len();
        if pruned > 0 {
            debug!(pruned, remaining = agents.len(), "Pruned ended agent records");
        }
        pruned
    }

    /// Terminate every active agent and wait for the processes to exit.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.list_active().await.into_iter().map(|r| r.id).collect();
        for id in &ids {
            if let Err(e) = self.terminate(id).await {
                warn!(agent_id = %id, error = %e, "Failed to terminate agent");
            }
        }

        let deadline = Instant::now() + self.terminate_timeout + Duration::from_secs(1);
        while Instant::now() < deadline {
            let remaining = self.agents.read().await.values().filter(|e| !e.exited).count();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!(agents = ids.len(), "Agent pool shut down");
    }
}

/// Final status for an agent that exited with `code` (`None` for a signal).
const fn reconcile_exit(code: Option<i32>, terminate_requested: bool) -> AgentStatus {
    match code {
        Some(0) => AgentStatus::Terminated,
        Some(_) => AgentStatus::Failed,
        None if terminate_requested => AgentStatus::Terminated,
        None => AgentStatus::Failed,
    }
}
