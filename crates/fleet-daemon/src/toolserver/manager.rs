//! Lazy tool-server connection pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::config::ToolServerConfig;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::ToolServerError;
use super::client::ToolServerClient;
use super::registry::{ServerDescriptor, ToolServerRegistry};

/// Lifecycle of one server slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

/// A known server and its current status.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub command: String,
    pub capabilities: Vec<String>,
    pub status: ServerStatus,
    pub pid: Option<u32>,
}

/// Timeouts applied by the manager.
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ToolServerConfig> for ManagerOptions {
    fn from(config: &ToolServerConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        }
    }
}

struct SlotState {
    status: ServerStatus,
    client: Option<Arc<ToolServerClient>>,
}

struct ServerSlot {
    descriptor: ServerDescriptor,
    /// Serialises start/stop so only one process exists per slot.
    lifecycle: Mutex<()>,
    state: RwLock<SlotState>,
}

impl ServerSlot {
    /// Current status, demoting a running slot whose process has exited.
    async fn refresh(&self) -> (ServerStatus, Option<u32>) {
        let mut state = self.state.write().await;
        let exited = state
            .client
            .as_ref()
            .filter(|c| !c.is_running())
            .map(|c| c.exit_info());
        if let Some(exit) = exited {
            warn!(
                server = %self.descriptor.name,
                ?exit,
                "Tool server exited unexpectedly"
            );
            state.client = None;
            state.status = ServerStatus::Failed;
        }
        (state.status, state.client.as_ref().map(|c| c.pid()))
    }
}

/// Starts tool servers on first use and routes calls to them.
pub struct ToolServerManager {
    slots: HashMap<String, Arc<ServerSlot>>,
    options: ManagerOptions,
}

impl ToolServerManager {
    pub fn new(registry: &ToolServerRegistry, options: ManagerOptions) -> Self {
        let slots = registry
            .descriptors()
            .map(|d| {
                let slot = ServerSlot {
                    descriptor: d.clone(),
                    lifecycle: Mutex::new(()),
                    state: RwLock::new(SlotState {
                        status: ServerStatus::Stopped,
                        client: None,
                    }),
                };
                (d.name.clone(), Arc::new(slot))
            })
            .collect();
        Self { slots, options }
    }

    pub const fn options(&self) -> &ManagerOptions {
        &self.options
    }

    fn slot(&self, name: &str) -> Result<&Arc<ServerSlot>, ToolServerError> {
        self.slots
            .get(name)
            .ok_or_else(|| ToolServerError::UnknownServer {
                name: name.to_string(),
            })
    }

    /// Every known server with its status. Starts nothing.
    pub async fn list_servers(&self) -> Vec<ServerSummary> {
        let mut summaries = Vec::with_capacity(self.slots.len());
        for slot in self.slots.values() {
            let (status, pid) = slot.refresh().await;
            summaries.push(ServerSummary {
                name: slot.descriptor.name.clone(),
                command: slot.descriptor.command.clone(),
                capabilities: slot.descriptor.capabilities.clone(),
                status,
                pid,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub async fn status(&self, name: &str) -> Result<ServerStatus, ToolServerError> {
        Ok(self.slot(name)?.refresh().await.0)
    }

    /// Start `name` if it is not already running.
    pub async fn start_server(&self, name: &str) -> Result<(), ToolServerError> {
        let slot = self.slot(name)?;
        self.ensure_running(slot).await.map(|_| ())
    }

    async fn ensure_running(
        &self,
        slot: &ServerSlot,
    ) -> Result<Arc<ToolServerClient>, ToolServerError> {
        if let Some(client) = Self::running_client(slot).await {
            return Ok(client);
        }

        let _guard = slot.lifecycle.lock().await;
        // Another caller may have finished starting it while we waited.
        if let Some(client) = Self::running_client(slot).await {
            return Ok(client);
        }

        slot.state.write().await.status = ServerStatus::Starting;
        match ToolServerClient::start(&slot.descriptor, self.options.handshake_timeout).await {
            Ok(client) => {
                let client = Arc::new(client);
                let mut state = slot.state.write().await;
                state.status = ServerStatus::Running;
                state.client = Some(Arc::clone(&client));
                info!(server = %slot.descriptor.name, pid = client.pid(), "Tool server running");
                Ok(client)
            }
            Err(e) => {
                let mut state = slot.state.write().await;
                state.status = ServerStatus::Stopped;
                state.client = None;
                Err(e)
            }
        }
    }

    async fn running_client(slot: &ServerSlot) -> Option<Arc<ToolServerClient>> {
        let (status, _) = slot.refresh().await;
        if status != ServerStatus::Running {
            return None;
        }
        slot.state.read().await.client.clone()
    }

    /// Stop `name`. The slot ends `stopped` even if the process had to be killed.
    pub async fn stop_server(&self, name: &str) -> Result<(), ToolServerError> {
        let slot = self.slot(name)?;
        let _guard = slot.lifecycle.lock().await;
        let client = {
            let mut state = slot.state.write().await;
            state.status = ServerStatus::Stopped;
            state.client.take()
        };
        if let Some(client) = client {
            let exit = client.shutdown(self.options.stop_timeout).await;
            info!(server = %name, ?exit, "Tool server stopped");
        }
        Ok(())
    }

    /// Stop every server.
    pub async fn stop_all(&self) {
        for name in self.slots.keys() {
            if let Err(e) = self.stop_server(name).await {
                warn!(server = %name, error = %e, "Failed to stop tool server");
            }
        }
    }

    /// Call `tool` on `server` with the default call timeout.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, ToolServerError> {
        self.call_tool_with_timeout(server, tool, arguments, self.options.call_timeout)
            .await
    }

    /// Call `tool` on `server`, starting it first if needed.
    pub async fn call_tool_with_timeout(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ToolServerError> {
        let slot = self.slot(server)?;
        let client = self.ensure_running(slot).await?;
        let result = client.call_tool(tool, arguments, timeout).await;
        if matches!(result, Err(ToolServerError::ServerExited { .. })) {
            slot.refresh().await;
        }
        result
    }

    /// Ask `server` which tools it exposes.
    pub async fn list_tools(&self, server: &str) -> Result<Value, ToolServerError> {
        let slot = self.slot(server)?;
        let client = self.ensure_running(slot).await?;
        client.list_tools(self.options.call_timeout).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn manager() -> ToolServerManager {
        let registry = ToolServerRegistry::from_descriptors([
            ServerDescriptor::new("alpha", "true", &[]),
            ServerDescriptor::new("beta", "true", &[]),
        ])
        .unwrap();
        ToolServerManager::new(&registry, ManagerOptions::default())
    }

    #[tokio::test]
    async fn list_servers_starts_nothing() {
        let manager = manager();
        let servers = manager.list_servers().await;
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "alpha");
        assert!(servers.iter().all(|s| s.status == ServerStatus::Stopped));
        assert!(servers.iter().all(|s| s.pid.is_none()));
    }

    #[tokio::test]
    async fn unknown_server_is_rejected() {
        let manager = manager();
        let err = manager
            .call_tool("gamma", "x", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::UnknownServer { name } if name == "gamma"));
        assert!(manager.stop_server("gamma").await.is_err());
    }

    #[tokio::test]
    async fn stopping_a_stopped_server_is_a_no_op() {
        let manager = manager();
        manager.stop_server("alpha").await.unwrap();
        assert_eq!(manager.status("alpha").await.unwrap(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn missing_binary_fails_start_and_stays_stopped() {
        let registry = ToolServerRegistry::from_descriptors([ServerDescriptor::new(
            "ghost",
            "/nonexistent/fleet-tool-server",
            &[],
        )])
        .unwrap();
        let manager = ToolServerManager::new(&registry, ManagerOptions::default());
        let err = manager.start_server("ghost").await.unwrap_err();
        assert!(matches!(err, ToolServerError::StartFailed { .. }));
        assert_eq!(manager.status("ghost").await.unwrap(), ServerStatus::Stopped);
    }
}
