#![cfg(unix)]
#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! The supervising daemon against real child processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use fleet_daemon::process;
use fleet_daemon::supervisor::{DaemonState, DaemonStatus, SupervisingDaemon, SupervisorOptions};

/// Crashes on its first run, then stays up. Each run appends its pid.
const CRASH_ONCE: &str = r#"
echo $$ >> "$0.pids"
if [ -f "$0.ran" ]; then exec sleep 30; fi
touch "$0.ran"
exit 1
"#;

fn options(dir: &Path, script: &str) -> SupervisorOptions {
    let path = dir.join("child.sh");
    std::fs::write(&path, script).unwrap();
    SupervisorOptions {
        command: PathBuf::from("sh"),
        args: vec![path.display().to_string()],
        state_path: dir.join("daemon.json"),
        stop_timeout: Duration::from_secs(2),
        backoff_initial: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        stable_after: Duration::from_secs(30),
    }
}

async fn wait_for_state(path: &Path, done: impl Fn(&DaemonState) -> bool) -> DaemonState {
    for _ in 0..200 {
        if let Ok(Some(state)) = DaemonState::read(path)
            && done(&state)
        {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    DaemonState::read(path).unwrap().unwrap()
}

fn pids(dir: &Path) -> Vec<u32> {
    std::fs::read_to_string(dir.join("child.sh.pids"))
        .unwrap_or_default()
        .lines()
        .map(|l| l.trim().parse().unwrap())
        .collect()
}

#[tokio::test]
async fn crashed_child_is_restarted_and_stopped_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let opts = options(dir.path(), CRASH_ONCE);
    let state_path = opts.state_path.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = tokio::spawn(SupervisingDaemon::new(opts).run(shutdown_rx));

    let running = wait_for_state(&state_path, |s| {
        s.status == DaemonStatus::Running && s.restart_count == 1
    })
    .await;
    assert_eq!(running.status, DaemonStatus::Running);
    assert_eq!(running.restart_count, 1);

    let mut started = pids(dir.path());
    for _ in 0..100 {
        if started.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        started = pids(dir.path());
    }
    assert_eq!(started.len(), 2);
    assert_ne!(started[0], started[1]);
    assert_eq!(running.pid, Some(started[1]));

    shutdown_tx.send(true).unwrap();
    let final_state = daemon.await.unwrap().unwrap();
    assert_eq!(final_state.status, DaemonStatus::Stopped);
    assert_eq!(final_state.pid, None);
    assert_eq!(final_state.restart_count, 1);
    assert!(!process::is_alive(started[1]));

    let persisted = DaemonState::read(&state_path).unwrap().unwrap();
    assert_eq!(persisted.status, DaemonStatus::Stopped);
}

#[tokio::test]
async fn missing_program_counts_as_a_crash() {
    let dir = TempDir::new().unwrap();
    let mut opts = options(dir.path(), "");
    opts.command = PathBuf::from("/nonexistent/fleet-child");
    let state_path = opts.state_path.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = tokio::spawn(SupervisingDaemon::new(opts).run(shutdown_rx));

    let state = wait_for_state(&state_path, |s| s.restart_count >= 2).await;
    assert!(state.restart_count >= 2);
    assert_ne!(state.status, DaemonStatus::Running);

    shutdown_tx.send(true).unwrap();
    let final_state = daemon.await.unwrap().unwrap();
    assert_eq!(final_state.status, DaemonStatus::Stopped);
}

#[tokio::test]
async fn killed_child_is_reported_crashed_then_replaced() {
    let dir = TempDir::new().unwrap();
    let mut opts = options(dir.path(), "echo $$ >> \"$0.pids\"\nexec sleep 30\n");
    // Long enough for the crashed state to be observed between runs.
    opts.backoff_initial = Duration::from_millis(500);
    opts.backoff_max = Duration::from_secs(1);
    let state_path = opts.state_path.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = tokio::spawn(SupervisingDaemon::new(opts).run(shutdown_rx));

    let first = wait_for_state(&state_path, |s| s.status == DaemonStatus::Running).await;
    assert_eq!(first.restart_count, 0);
    let first_pid = first.pid.unwrap();
    assert!(process::is_alive(first_pid));

    process::force_kill(first_pid);

    let crashed = wait_for_state(&state_path, |s| s.status == DaemonStatus::Crashed).await;
    assert_eq!(crashed.status, DaemonStatus::Crashed);
    assert_eq!(crashed.restart_count, 1);
    assert_eq!(crashed.pid, None);

    let second = wait_for_state(&state_path, |s| {
        s.status == DaemonStatus::Running && s.restart_count == 1
    })
    .await;
    assert_eq!(second.status, DaemonStatus::Running);
    let second_pid = second.pid.unwrap();
    assert_ne!(second_pid, first_pid);

    shutdown_tx.send(true).unwrap();
    let final_state = daemon.await.unwrap().unwrap();
    assert_eq!(final_state.status, DaemonStatus::Stopped);
    assert_eq!(final_state.restart_count, 1);
    assert!(!process::is_alive(second_pid));
}

#[tokio::test]
async fn unwritable_state_file_does_not_stop_supervision() {
    let dir = TempDir::new().unwrap();
    let mut opts = options(dir.path(), CRASH_ONCE);
    // The state file's directory is a regular file, so every write fails.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "").unwrap();
    opts.state_path = blocker.join("daemon.json");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = tokio::spawn(SupervisingDaemon::new(opts).run(shutdown_rx));

    let mut started = pids(dir.path());
    for _ in 0..200 {
        if started.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        started = pids(dir.path());
    }
    assert_eq!(started.len(), 2, "crashed child was not restarted");
    assert!(process::is_alive(started[1]));
    assert!(!daemon.is_finished());

    // Only the final write is reported, after the child is stopped.
    shutdown_tx.send(true).unwrap();
    assert!(daemon.await.unwrap().is_err());
    assert!(!process::is_alive(started[1]));
}
