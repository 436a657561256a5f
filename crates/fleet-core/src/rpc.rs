//! Line-delimited JSON-RPC messages exchanged with tool-server subprocesses.
//!
//! Each message is a single JSON object terminated by `\n` on the child's
//! stdin (requests) or stdout (responses).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Protocol version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Well-known method names.
pub mod methods {
    /// Handshake sent once after spawn; the server must answer before use.
    pub const INITIALIZE: &str = "initialize";
    /// Enumerate the tools a server exposes.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Invoke a named tool with arguments.
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    /// `tools/call` request for `tool` with `arguments`.
    pub fn tool_call(id: u64, tool: &str, arguments: Value) -> Self {
        Self::new(
            id,
            methods::TOOLS_CALL,
            serde_json::json!({ "name": tool, "arguments": arguments }),
        )
    }

    /// Serialize to a single line (without the trailing newline).
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error object carried in a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("remote error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Incoming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Response {
    /// Successful response carrying `result`.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Collapse into the call outcome. A missing or `null` result is `Value::Null`.
    pub fn into_result(self) -> std::result::Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Parse one stdout line from a tool server.
pub fn parse_response_line(line: &str) -> Result<Response> {
    Ok(serde_json::from_str(line.trim())?)
}
