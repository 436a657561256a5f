//! Tool servers: pluggable subprocesses speaking line-delimited JSON-RPC.
//!
//! The [`ToolServerManager`] starts servers lazily on first use and routes
//! tool calls to them over a single multiplexed stdio channel per server.

pub mod client;
pub mod manager;
pub mod registry;

use std::time::Duration;

use fleet_core::rpc::RpcError;

pub use client::ToolServerClient;
pub use manager::{ManagerOptions, ServerStatus, ServerSummary, ToolServerManager};
pub use registry::{RegistryError, ServerDescriptor, ToolServerRegistry};

/// Errors from tool-server operations.
#[derive(Debug, thiserror::Error)]
pub enum ToolServerError {
    #[error("Unknown tool server: {name}")]
    UnknownServer { name: String },

    #[error("Failed to start tool server '{name}': {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Call '{method}' on '{server}' timed out after {timeout:?}")]
    CallTimeout {
        server: String,
        method: String,
        timeout: Duration,
    },

    #[error("Tool server '{name}' exited")]
    ServerExited { name: String },

    #[error("Tool server '{server}' returned an error: {error}")]
    Remote {
        server: String,
        #[source]
        error: RpcError,
    },

    #[error("Protocol error talking to '{server}': {reason}")]
    Protocol { server: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
