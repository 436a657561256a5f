//! Context handed to sub-agent processes.
//!
//! Tenant and task information travels to a child only through its own
//! environment and launch arguments; the orchestrator's environment is never
//! modified.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ENV_AGENT_ID: &str = "FLEET_AGENT_ID";
pub const ENV_AGENT_ROLE: &str = "FLEET_AGENT_ROLE";
pub const ENV_TENANT: &str = "FLEET_TENANT";
pub const ENV_AGENT_CONTEXT: &str = "FLEET_AGENT_CONTEXT";

/// Explicit per-agent context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl AgentContext {
    pub fn for_tenant(tenant: Option<&str>) -> Self {
        Self {
            tenant: tenant.map(ToOwned::to_owned),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Variables set on the child process.
    pub fn env_vars(&self, agent_id: &str, role: &str) -> BTreeMap<&'static str, String> {
        let mut env = BTreeMap::new();
        env.insert(ENV_AGENT_ID, agent_id.to_string());
        env.insert(ENV_AGENT_ROLE, role.to_string());
        env.insert(ENV_TENANT, self.tenant.clone().unwrap_or_default());
        env.insert(ENV_AGENT_CONTEXT, self.to_json());
        env
    }

    /// Placeholder values for launch templates.
    pub fn template_vars(&self, agent_id: &str, role: &str) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("agent_id", agent_id.to_string());
        vars.insert("role", role.to_string());
        vars.insert("tenant", self.tenant.clone().unwrap_or_default());
        vars.insert("task_id", self.task_id.clone().unwrap_or_default());
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_carries_identity_and_context() {
        let ctx = AgentContext::for_tenant(Some("acme")).with_task("t-1");
        let env = ctx.env_vars("agent-9", "coder");
        assert_eq!(env[ENV_AGENT_ID], "agent-9");
        assert_eq!(env[ENV_AGENT_ROLE], "coder");
        assert_eq!(env[ENV_TENANT], "acme");
        assert_eq!(env[ENV_AGENT_CONTEXT], r#"{"tenant":"acme","task_id":"t-1"}"#);
    }

    #[test]
    fn missing_tenant_is_empty() {
        let ctx = AgentContext::default();
        assert_eq!(ctx.env_vars("a", "qa")[ENV_TENANT], "");
        assert_eq!(ctx.template_vars("a", "qa")["task_id"], "");
    }
}
