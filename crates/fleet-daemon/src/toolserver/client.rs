//! One running tool-server subprocess and its request channel.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fleet_core::rpc::{self, Request, methods};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::ToolServerError;
use super::registry::ServerDescriptor;
use crate::process;

type Reply = Result<Value, ToolServerError>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Malformed stdout lines kept per server.
const MALFORMED_KEEP: usize = 32;

/// How a tool-server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

/// Connection to a started tool server.
///
/// Requests from any number of tasks share the same stdin; responses are
/// matched back to callers by request id.
pub struct ToolServerClient {
    name: String,
    pid: u32,
    stdin_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    malformed: Arc<Mutex<VecDeque<String>>>,
    server_info: Value,
}

impl ToolServerClient {
    /// Spawn the server and complete the `initialize` handshake.
    ///
    /// The process is killed if the handshake does not finish within
    /// `handshake_timeout`.
    #[allow(clippy::too_many_lines)]
    pub async fn start(
        descriptor: &ServerDescriptor,
        handshake_timeout: Duration,
    ) -> Result<Self, ToolServerError> {
        let name = descriptor.name.clone();
        let start_failed = |reason: String| ToolServerError::StartFailed {
            name: name.clone(),
            reason,
        };

        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(server = %name, command = %descriptor.command, "Spawning tool server");
        let mut child = cmd.spawn().map_err(|e| start_failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| start_failed("process exited before it could be tracked".into()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| start_failed("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| start_failed("Failed to capture stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            process::forward_stderr(stderr, format!("toolserver:{name}"));
        }

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        let writer_name = name.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!(server = %writer_name, "Failed to write to stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!(server = %writer_name, "Failed to write newline: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!(server = %writer_name, "Failed to flush stdin: {}", e);
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let malformed = Arc::new(Mutex::new(VecDeque::new()));
        let reader_pending = Arc::clone(&pending);
        let reader_malformed = Arc::clone(&malformed);
        let reader_name = name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match rpc::parse_response_line(&line) {
                    Ok(response) => {
                        let id = response.id;
                        let Some(tx) = reader_pending.lock().await.remove(&id) else {
                            debug!(server = %reader_name, id, "Response for unknown request id");
                            continue;
                        };
                        let reply = response.into_result().map_err(|error| {
                            ToolServerError::Remote {
                                server: reader_name.clone(),
                                error,
                            }
                        });
                        let _ = tx.send(reply);
                    }
                    Err(e) => {
                        warn!(server = %reader_name, error = %e, "Malformed tool-server output: {}", line);
                        let mut kept = reader_malformed.lock().await;
                        if kept.len() == MALFORMED_KEEP {
                            kept.pop_front();
                        }
                        kept.push_back(line);
                    }
                }
            }
            debug!(server = %reader_name, "stdout reader finished");
            // Anything still waiting will never be answered.
            for (_, tx) in reader_pending.lock().await.drain() {
                let _ = tx.send(Err(ToolServerError::ServerExited {
                    name: reader_name.clone(),
                }));
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let waiter_name = name.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(server = %waiter_name, error = %e, "Error waiting for tool server");
                    None
                }
            };
            info!(server = %waiter_name, pid, ?code, "Tool server exited");
            let _ = exit_tx.send(Some(ExitInfo { code }));
        });

        let mut client = Self {
            name,
            pid,
            stdin_tx,
            pending,
            next_id: AtomicU64::new(1),
            exit_rx,
            malformed,
            server_info: Value::Null,
        };

        let params = json!({
            "client": "fleet",
            "version": env!("CARGO_PKG_VERSION"),
        });
        match client
            .request(methods::INITIALIZE, params, handshake_timeout)
            .await
        {
            Ok(info) => {
                info!(server = %client.name, pid, "Tool server handshake complete");
                client.server_info = info;
                Ok(client)
            }
            Err(e) => {
                warn!(server = %client.name, pid, error = %e, "Tool server handshake failed");
                process::force_kill(pid);
                Err(ToolServerError::StartFailed {
                    name: client.name.clone(),
                    reason: format!("handshake failed: {e}"),
                })
            }
        }
    }

    /// Send one request and wait for its response, bounded by `timeout`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ToolServerError> {
        if !self.is_running() {
            return Err(self.exited());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = Request::new(id, method, params)
            .to_line()
            .map_err(|e| ToolServerError::Protocol {
                server: self.name.clone(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.stdin_tx.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(self.exited());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.exited()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolServerError::CallTimeout {
                    server: self.name.clone(),
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Invoke `tool` with `arguments`.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ToolServerError> {
        let params = json!({ "name": tool, "arguments": arguments });
        self.request(methods::TOOLS_CALL, params, timeout).await
    }

    /// Ask the server which tools it exposes.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Value, ToolServerError> {
        self.request(methods::TOOLS_LIST, Value::Null, timeout).await
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn shutdown(&self, grace: Duration) -> Option<ExitInfo> {
        if let Some(info) = self.exit_info() {
            return Some(info);
        }
        process::request_terminate(self.pid);
        if let Some(info) = self.wait_exit(grace).await {
            return Some(info);
        }
        warn!(server = %self.name, pid = self.pid, "Grace period expired, sending SIGKILL");
        process::force_kill(self.pid);
        self.wait_exit(Duration::from_secs(1)).await
    }

    async fn wait_exit(&self, limit: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        tokio::time::timeout(limit, rx.wait_for(Option::is_some))
            .await
            .ok()
            .and_then(Result::ok)
            .and_then(|info| *info)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Result of the `initialize` handshake.
    pub const fn server_info(&self) -> &Value {
        &self.server_info
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Recent stdout lines that were not valid responses.
    pub async fn malformed_lines(&self) -> Vec<String> {
        self.malformed.lock().await.iter().cloned().collect()
    }

    fn exited(&self) -> ToolServerError {
        ToolServerError::ServerExited {
            name: self.name.clone(),
        }
    }
}

impl Drop for ToolServerClient {
    fn drop(&mut self) {
        if self.is_running() {
            debug!(server = %self.name, pid = self.pid, "Client dropped, killing tool server");
            process::force_kill(self.pid);
        }
    }
}
