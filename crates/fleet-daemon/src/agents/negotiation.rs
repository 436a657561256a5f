//! Bidding-based task assignment and hierarchical teams.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::context::AgentContext;
use super::pool::{AgentPool, PoolError};

/// Errors from negotiation and team operations.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("Team not found: {id}")]
    TeamNotFound { id: String },

    #[error("Agent '{agent}' not found in team {team}")]
    NodeNotFound { team: String, agent: String },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// An agent's offer to take a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub task_id: String,
    pub agent_name: String,
    pub proposal: String,
    /// Estimated completion time in seconds.
    pub estimated_time: f64,
    pub cost: f64,
    /// In `0.0..=1.0`.
    pub confidence: f64,
}

/// Ordering used to pick a winner: higher confidence, then lower cost, then
/// lower estimated time, then agent name.
fn rank(a: &Bid, b: &Bid) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.cost.total_cmp(&b.cost))
        .then_with(|| a.estimated_time.total_cmp(&b.estimated_time))
        .then_with(|| a.agent_name.cmp(&b.agent_name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Idle,
    Working,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamNode {
    pub role: String,
    pub agent_name: String,
    pub status: NodeStatus,
    pub task: Option<String>,
    /// Pool agent backing this node, once staffed.
    pub agent_id: Option<String>,
    pub children: Vec<TeamNode>,
}

impl TeamNode {
    fn new(role: &str, agent_name: String) -> Self {
        Self {
            role: role.to_string(),
            agent_name,
            status: NodeStatus::Idle,
            task: None,
            agent_id: None,
            children: Vec::new(),
        }
    }

    pub fn find(&self, agent_name: &str) -> Option<&Self> {
        if self.agent_name == agent_name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(agent_name))
    }

    fn find_mut(&mut self, agent_name: &str) -> Option<&mut Self> {
        if self.agent_name == agent_name {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(agent_name))
    }

    /// Descendant named `agent_name`, excluding this node.
    fn descendant_mut(&mut self, agent_name: &str) -> Option<&mut Self> {
        self.children.iter_mut().find_map(|c| c.find_mut(agent_name))
    }

    fn visit_mut(&mut self, f: &mut impl FnMut(&mut Self)) {
        f(self);
        for child in &mut self.children {
            child.visit_mut(f);
        }
    }
}

/// Requested members for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRequest {
    pub role: String,
    pub count: usize,
}

/// Shape of a team to form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamFormation {
    pub lead_role: String,
    pub lead_name: String,
    pub members: Vec<RoleRequest>,
}

/// A team rooted at its lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamTree {
    pub id: String,
    pub root: TeamNode,
}

impl TeamTree {
    /// Number of nodes, lead included.
    pub fn size(&self) -> usize {
        fn count(node: &TeamNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }
}

/// Collects bids and manages teams.
#[derive(Default)]
pub struct NegotiationManager {
    bids: RwLock<HashMap<String, Vec<Bid>>>,
    teams: RwLock<HashMap<String, TeamTree>>,
}

impl NegotiationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bid. A later bid from the same agent replaces its earlier one.
    pub async fn submit_bid(&self, bid: Bid) {
        let mut bids = self.bids.write().await;
        let task_bids = bids.entry(bid.task_id.clone()).or_default();
        debug!(task = %bid.task_id, agent = %bid.agent_name, confidence = bid.confidence, "Bid received");
        match task_bids.iter_mut().find(|b| b.agent_name == bid.agent_name) {
            Some(existing) => *existing = bid,
            None => task_bids.push(bid),
        }
    }

    pub async fn bids(&self, task_id: &str) -> Vec<Bid> {
        self.bids.read().await.get(task_id).cloned().unwrap_or_default()
    }

    /// Best bid for `task_id`, if any.
    pub async fn evaluate_bids(&self, task_id: &str) -> Option<Bid> {
        self.bids
            .read()
            .await
            .get(task_id)?
            .iter()
            .min_by(|a, b| rank(a, b))
            .cloned()
    }

    /// Pick the winner for `task_id` and close its bidding.
    pub async fn award(&self, task_id: &str) -> Option<Bid> {
        let bids = self.bids.write().await.remove(task_id)?;
        let winner = bids.into_iter().min_by(rank)?;
        info!(task = %task_id, agent = %winner.agent_name, "Task awarded");
        Some(winner)
    }

    /// Build a team tree and return its id.
    ///
    /// Members are named `<role>-<n>` with `n` counting from 1 per role.
    pub async fn form_team(&self, formation: &TeamFormation) -> String {
        let mut root = TeamNode::new(&formation.lead_role, formation.lead_name.clone());
        for request in &formation.members {
            for n in 1..=request.count {
                root.children
                    .push(TeamNode::new(&request.role, format!("{}-{n}", request.role)));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let tree = TeamTree {
            id: id.clone(),
            root,
        };
        info!(team = %id, lead = %formation.lead_name, size = tree.size(), "Team formed");
        self.teams.write().await.insert(id.clone(), tree);
        id
    }

    /// Hand `task` from `from` to `to`, which must sit beneath `from`.
    pub async fn delegate(
        &self,
        team_id: &str,
        from: &str,
        to: &str,
        task: &str,
    ) -> Result<(), NegotiationError> {
        let mut teams = self.teams.write().await;
        let tree = teams
            .get_mut(team_id)
            .ok_or_else(|| NegotiationError::TeamNotFound {
                id: team_id.to_string(),
            })?;
        let not_found = |agent: &str| NegotiationError::NodeNotFound {
            team: team_id.to_string(),
            agent: agent.to_string(),
        };

        let delegator = tree.root.find_mut(from).ok_or_else(|| not_found(from))?;
        let node = delegator
            .descendant_mut(to)
            .ok_or_else(|| not_found(to))?;
        node.status = NodeStatus::Working;
        node.task = Some(task.to_string());
        info!(team = %team_id, from, to, task, "Task delegated");
        Ok(())
    }

    /// Mark `agent`'s current task done.
    pub async fn complete(&self, team_id: &str, agent: &str) -> Result<(), NegotiationError> {
        let mut teams = self.teams.write().await;
        let tree = teams
            .get_mut(team_id)
            .ok_or_else(|| NegotiationError::TeamNotFound {
                id: team_id.to_string(),
            })?;
        let node = tree
            .root
            .find_mut(agent)
            .ok_or_else(|| NegotiationError::NodeNotFound {
                team: team_id.to_string(),
                agent: agent.to_string(),
            })?;
        node.status = NodeStatus::Done;
        Ok(())
    }

    pub async fn team(&self, team_id: &str) -> Option<TeamTree> {
        self.teams.read().await.get(team_id).cloned()
    }

    pub async fn dissolve(&self, team_id: &str) -> Option<TeamTree> {
        let tree = self.teams.write().await.remove(team_id);
        if tree.is_some() {
            info!(team = %team_id, "Team dissolved");
        }
        tree
    }

    /// Spawn a pool agent for every node of the team that has none.
    ///
    /// Returns the ids of the agents started. Nodes staffed before a spawn
    /// failure keep their agents.
    pub async fn staff_team(
        &self,
        team_id: &str,
        pool: &AgentPool,
        context: &AgentContext,
    ) -> Result<Vec<String>, NegotiationError> {
        let mut tree = self
            .team(team_id)
            .await
            .ok_or_else(|| NegotiationError::TeamNotFound {
                id: team_id.to_string(),
            })?;

        let mut wanted = Vec::new();
        tree.root.visit_mut(&mut |node| {
            if node.agent_id.is_none() {
                wanted.push((node.agent_name.clone(), node.role.clone()));
            }
        });

        let mut started = Vec::new();
        let mut failure = None;
        for (agent_name, role) in wanted {
            match pool.spawn(&role, context).await {
                Ok(agent) => {
                    if let Some(node) = tree.root.find_mut(&agent_name) {
                        node.agent_id = Some(agent.id.clone());
                    }
                    started.push(agent.id);
                }
                Err(e) => {
                    warn!(team = %team_id, agent = %agent_name, error = %e, "Failed to staff team node");
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(stored) = self.teams.write().await.get_mut(team_id) {
            *stored = tree;
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(started),
        }
    }
}
