//! Sub-agents: the process pool, bidding and teams, and elastic scaling.

pub mod context;
pub mod negotiation;
pub mod pool;
pub mod scaling;
pub mod state_store;

pub use context::AgentContext;
pub use negotiation::{
    Bid, NegotiationError, NegotiationManager, NodeStatus, RoleRequest, TeamFormation, TeamNode,
    TeamTree,
};
pub use pool::{AgentPool, AgentRecord, AgentStatus, PoolError, SpawnedAgent};
pub use scaling::{DemandSource, ElasticScalingEngine, ScalingError, TickSummary, ToolDemandSource};
pub use state_store::{AgentPids, LockedScalingState, ScalingState, ScalingStateStore};
