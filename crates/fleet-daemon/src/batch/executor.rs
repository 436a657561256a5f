//! The external capability that runs a combined batch.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::LaunchTemplate;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::BatchError;
use crate::process;

/// What the executor is asked to run.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub task_type: String,
    pub tenant: Option<String>,
    pub task_ids: Vec<String>,
    pub payload: String,
}

/// Runs one combined payload and returns the raw response text.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &BatchRequest) -> Result<String, BatchError>;
}

/// Executor that starts a process per batch from a launch template.
///
/// The payload is written to the child's stdin and its stdout is the raw
/// result. Placeholders `{task_type}`, `{tenant}` and `{count}` are available
/// to the template. A run that outlives `timeout` is killed and fails the
/// batch.
pub struct CommandTaskExecutor {
    template: LaunchTemplate,
    timeout: Duration,
}

impl CommandTaskExecutor {
    pub const fn new(template: LaunchTemplate, timeout: Duration) -> Self {
        Self { template, timeout }
    }
}

#[async_trait]
impl TaskExecutor for CommandTaskExecutor {
    async fn execute(&self, request: &BatchRequest) -> Result<String, BatchError> {
        let mut vars = BTreeMap::new();
        vars.insert("task_type", request.task_type.clone());
        vars.insert("tenant", request.tenant.clone().unwrap_or_default());
        vars.insert("count", request.task_ids.len().to_string());

        let mut cmd = process::command_from_template(&self.template, &vars);
        cmd.stdin(Stdio::piped()).kill_on_drop(true);

        debug!(command = %self.template.command, task_type = %request.task_type, "Starting task executor");
        let mut child = cmd.spawn().map_err(|e| BatchError::ExecutorFailed {
            reason: format!("failed to start '{}': {e}", self.template.command),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = request.payload.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    warn!(error = %e, "Failed to write batch payload to executor");
                }
                // stdin is closed on drop so the executor sees EOF.
            });
        }

        // Dropping the wait on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BatchError::ExecutorFailed {
                reason: format!("timed out after {}s", self.timeout.as_secs_f64()),
            })?
            .map_err(|e| BatchError::ExecutorFailed {
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BatchError::ExecutorFailed {
                reason: format!("exited with {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request() -> BatchRequest {
        BatchRequest {
            task_type: "summary".into(),
            tenant: Some("acme".into()),
            task_ids: vec!["a".into()],
            payload: "### TASK a\n{}\n".into(),
        }
    }

    #[tokio::test]
    async fn stdout_is_the_raw_result() {
        let template = LaunchTemplate::new(
            "sh",
            &["-c", "n=$(grep -c '^### TASK' -); printf '{\"count\":%s,\"tenant\":\"%s\"}' \"$n\" \"$1\"", "sh", "{tenant}"],
        );
        let raw = CommandTaskExecutor::new(template, Duration::from_secs(10))
            .execute(&request())
            .await
            .unwrap();
        assert_eq!(raw, r#"{"count":1,"tenant":"acme"}"#);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let template = LaunchTemplate::new("sh", &["-c", "cat >/dev/null; echo boom >&2; exit 3"]);
        let err = CommandTaskExecutor::new(template, Duration::from_secs(10))
            .execute(&request())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn hung_executor_is_killed_after_the_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("finished");
        let template = LaunchTemplate::new(
            "sh",
            &["-c", "sleep 1; touch \"$1\"", "sh", marker.to_str().unwrap()],
        );

        let started = std::time::Instant::now();
        let err = CommandTaskExecutor::new(template, Duration::from_millis(200))
            .execute(&request())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(err.to_string().contains("timed out"), "{err}");

        // Killed before it could finish its work.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
