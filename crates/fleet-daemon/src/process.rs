//! Process helpers shared by every component that owns OS subprocesses.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use fleet_core::LaunchTemplate;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, warn};

/// Build a command from a launch template with placeholders substituted.
///
/// The child gets piped stdio; callers decide what to do with each stream.
pub fn command_from_template(template: &LaunchTemplate, vars: &BTreeMap<&str, String>) -> Command {
    let mut cmd = Command::new(&template.command);
    cmd.args(template.render_args(vars))
        .envs(template.render_env(vars))
        .stdin(if template.stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    if let Some(ref cwd) = template.cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

/// Send `signal` to `pid`. Failures are logged, not returned.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) has no memory-safety preconditions; pid comes from a
    // Child handle we spawned.
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, signal) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid, signal, error = %err, "Failed to signal process");
    }
}

/// Ask a process to exit with SIGTERM.
pub fn request_terminate(pid: u32) {
    #[cfg(unix)]
    send_signal(pid, libc::SIGTERM);
    #[cfg(not(unix))]
    let _ = pid;
}

/// Force-kill a process by pid.
pub fn force_kill(pid: u32) {
    #[cfg(unix)]
    send_signal(pid, libc::SIGKILL);
    #[cfg(not(unix))]
    let _ = pid;
}

/// Whether `pid` still refers to a live process we may signal.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, 0) };
    ret == 0
}

#[cfg(not(unix))]
pub const fn is_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns the exit code if known.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> Option<i32> {
    if let Some(pid) = child.id() {
        request_terminate(pid);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for process");
            let _ = child.kill().await;
            None
        }
        Err(_) => {
            warn!(grace = ?grace, "Grace period expired, sending SIGKILL");
            let _ = child.kill().await;
            None
        }
    }
}

/// Forward a child's stderr lines to the log under `label`.
pub fn forward_stderr(stderr: ChildStderr, label: String) {
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(process = %label, "stderr: {}", line);
        }
        debug!(process = %label, "stderr reader finished");
    });
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminate_child_stops_sleeping_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(is_alive(pid));

        let code = terminate_child(&mut child, Duration::from_secs(5)).await;
        // Killed by a signal, so no exit code.
        assert_eq!(code, None);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn template_command_substitutes_vars() {
        let mut template = LaunchTemplate::new("sh", &["-c", "echo {greeting}"]);
        template.env.insert("UNUSED".into(), "x".into());
        let mut vars = BTreeMap::new();
        vars.insert("greeting", "hello".to_string());

        let output = command_from_template(&template, &vars)
            .output()
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }
}
