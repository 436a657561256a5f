//! Demand-driven scale up and down of the agent pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::config::ScalingRule;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::context::AgentContext;
use super::pool::{AgentPool, AgentStatus, PoolError};
use super::state_store::{LockedScalingState, ScalingStateStore};
use crate::process;
use crate::toolserver::{ToolServerError, ToolServerManager};

/// Errors from the scaling engine.
#[derive(Debug, thiserror::Error)]
pub enum ScalingError {
    #[error("Cannot read demand for '{metric}': {reason}")]
    Demand { metric: String, reason: String },

    #[error("Scaling state error: {0}")]
    State(#[from] fleet_core::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    ToolServer(#[from] ToolServerError),

    #[error("Scaling state task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Source of the current demand value for a metric.
#[async_trait]
pub trait DemandSource: Send + Sync {
    async fn demand(&self, metric: &str) -> Result<f64, ScalingError>;
}

/// Reads demand by calling a metrics tool on a tool server.
///
/// The tool receives `{"metric": name}` and may answer with a number, a
/// numeric string, `{"value": n}` or text content holding a number.
pub struct ToolDemandSource {
    manager: Arc<ToolServerManager>,
    server: String,
    tool: String,
}

impl ToolDemandSource {
    pub fn new(manager: Arc<ToolServerManager>, server: &str, tool: &str) -> Self {
        Self {
            manager,
            server: server.to_string(),
            tool: tool.to_string(),
        }
    }
}

#[async_trait]
impl DemandSource for ToolDemandSource {
    async fn demand(&self, metric: &str) -> Result<f64, ScalingError> {
        let result = self
            .manager
            .call_tool(&self.server, &self.tool, json!({ "metric": metric }))
            .await?;
        demand_value(&result).ok_or_else(|| ScalingError::Demand {
            metric: metric.to_string(),
            reason: format!("not a number: {result}"),
        })
    }
}

fn demand_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(obj) => {
            if let Some(v) = obj.get("value") {
                return demand_value(v);
            }
            // {"content": [{"type": "text", "text": "3"}]}
            obj.get("content")?
                .as_array()?
                .iter()
                .find_map(|item| item.get("text").and_then(demand_value))
        }
        _ => None,
    }
}

/// What one tick changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub spawned: usize,
    pub terminated: usize,
}

/// Grows and shrinks agent groups per [`ScalingRule`].
pub struct ElasticScalingEngine {
    rules: Vec<ScalingRule>,
    pool: Arc<AgentPool>,
    demand: Arc<dyn DemandSource>,
    store: ScalingStateStore,
    last_scale_up: HashMap<String, Instant>,
}

impl ElasticScalingEngine {
    pub fn new(
        rules: Vec<ScalingRule>,
        pool: Arc<AgentPool>,
        demand: Arc<dyn DemandSource>,
        store: ScalingStateStore,
    ) -> Self {
        Self {
            rules,
            pool,
            demand,
            store,
            last_scale_up: HashMap::new(),
        }
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    /// Evaluate every rule once.
    pub async fn tick(&mut self) -> Result<TickSummary, ScalingError> {
        self.pool.prune_ended().await;
        let mut summary = TickSummary::default();
        let rules = self.rules.clone();
        for rule in &rules {
            let demand = match self.demand.demand(&rule.metric).await {
                Ok(demand) => demand,
                Err(e) => {
                    warn!(rule = %rule.key, error = %e, "Skipping rule, demand unavailable");
                    continue;
                }
            };
            let step = self.apply_rule(rule, demand).await?;
            summary.spawned += step.spawned;
            summary.terminated += step.terminated;
        }
        Ok(summary)
    }

    async fn apply_rule(&mut self, rule: &ScalingRule, demand: f64) -> Result<TickSummary, ScalingError> {
        // The lock is held from reading the rule's agents until the decision
        // is saved, so scalers sharing the file never act on the same gap.
        let mut locked = self.lock_state().await?;
        let recorded = locked.state.get(&rule.key).cloned().unwrap_or_default();

        // Ids this process never spawned stay live while their recorded pid
        // does. Ids the pool reports as ended are dropped.
        let mut live = Vec::new();
        let mut active = Vec::new();
        let mut foreign = Vec::new();
        for id in &recorded {
            match self.pool.status(id).await {
                Some(AgentStatus::Active) => active.push(id.clone()),
                Some(AgentStatus::Terminated | AgentStatus::Failed) => {
                    debug!(rule = %rule.key, agent_id = %id, "Dropping ended agent");
                    continue;
                }
                None => match locked.pids.get(id) {
                    Some(&pid) if process::is_alive(pid) => foreign.push((id.clone(), pid)),
                    pid => {
                        debug!(rule = %rule.key, agent_id = %id, ?pid, "Dropping agent that is no longer running");
                        continue;
                    }
                },
            }
            live.push(id.clone());
        }
        let mut summary = TickSummary::default();

        if demand > rule.scale_up_threshold && live.len() < rule.desired_count {
            let deficit = rule.desired_count - live.len();
            info!(rule = %rule.key, demand, current = live.len(), deficit, "Scaling up");
            let context = AgentContext::for_tenant(rule.tenant.as_deref());
            let mut owned = live;
            for _ in 0..deficit {
                match self.pool.spawn(&rule.role, &context).await {
                    Ok(agent) => {
                        owned.push(agent.id.clone());
                        locked.state.insert(rule.key.clone(), owned.clone());
                        if let Some(pid) = agent.pid {
                            locked.pids.insert(agent.id, pid);
                        }
                        locked = save_state(locked).await?;
                        summary.spawned += 1;
                    }
                    Err(e) => {
                        error!(rule = %rule.key, role = %rule.role, error = %e, "Scale-up spawn failed");
                        break;
                    }
                }
            }
            locked.state.insert(rule.key.clone(), owned);
            self.last_scale_up.insert(rule.key.clone(), Instant::now());
        } else if demand <= rule.scale_down_threshold && !live.is_empty() {
            let cooldown = Duration::from_secs(rule.cooldown_secs);
            if let Some(at) = self.last_scale_up.get(&rule.key)
                && at.elapsed() < cooldown
            {
                debug!(rule = %rule.key, remaining = ?cooldown.saturating_sub(at.elapsed()), "Scale-down in cooldown");
                locked.state.insert(rule.key.clone(), live);
                commit_state(locked).await?;
                return Ok(summary);
            }

            info!(rule = %rule.key, demand, agents = live.len(), "Scaling down");
            for id in &active {
                self.pool.terminate(id).await?;
                summary.terminated += 1;
            }
            for (id, pid) in &foreign {
                self.terminate_foreign(&rule.key, id, *pid);
                summary.terminated += 1;
            }
            locked.state.remove(&rule.key);
        } else {
            locked.state.insert(rule.key.clone(), live);
        }
        commit_state(locked).await?;
        Ok(summary)
    }

    /// Stop an agent recorded by another process, killing it if it is still
    /// running after the pool's terminate timeout.
    fn terminate_foreign(&self, key: &str, id: &str, pid: u32) {
        info!(rule = %key, agent_id = %id, pid, "Terminating agent started by another process");
        process::request_terminate(pid);
        let grace = self.pool.terminate_timeout();
        let agent_id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if process::is_alive(pid) {
                warn!(agent_id = %agent_id, pid, "Agent ignored SIGTERM, killing");
                process::force_kill(pid);
            }
        });
    }

    async fn lock_state(&self) -> Result<LockedScalingState, ScalingError> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.lock()).await??)
    }

    /// Tick every `interval` until `shutdown` flips.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(rules = self.rules.len(), ?interval, "Scaling engine started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary != TickSummary::default() => {
                            info!(spawned = summary.spawned, terminated = summary.terminated, "Scaling tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Scaling tick failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        if let Err(e) = self.release().await {
            error!(error = %e, "Failed to release scaled agents");
        }
        info!("Scaling engine stopped");
    }

    /// Terminate the agents this process spawned and remove them from the
    /// shared state.
    pub async fn release(&self) -> Result<(), ScalingError> {
        let owned: HashSet<String> = self
            .pool
            .list_all()
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        self.pool.shutdown().await;

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            store.update(|state| {
                for ids in state.values_mut() {
                    ids.retain(|id| !owned.contains(id));
                }
            })
        })
        .await??;
        Ok(())
    }
}

/// Write the state and keep holding the lock.
async fn save_state(mut locked: LockedScalingState) -> Result<LockedScalingState, ScalingError> {
    let locked = tokio::task::spawn_blocking(move || {
        locked.save()?;
        Ok::<_, fleet_core::Error>(locked)
    })
    .await??;
    Ok(locked)
}

/// Write the state and release the lock.
async fn commit_state(mut locked: LockedScalingState) -> Result<(), ScalingError> {
    tokio::task::spawn_blocking(move || locked.save()).await??;
    Ok(())
}
