//! Fleet Daemon Library
//!
//! Process orchestration for a fleet of worker processes:
//! - Lazy tool-server connections over line-delimited JSON-RPC
//! - A supervising daemon that restarts the scheduler on crash
//! - Cron and file-watch task triggers with request batching
//! - A sub-agent pool with bidding, teams and elastic scaling

pub mod agents;
pub mod batch;
pub mod process;
pub mod scheduler;
pub mod supervisor;
pub mod toolserver;
