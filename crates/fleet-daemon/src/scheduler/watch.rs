//! Filesystem watching with trailing-edge debounce.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Watch `target` and send `key` whenever it changes.
///
/// Directories are watched recursively. A file is watched through its parent
/// directory so that it may be created, replaced by rename or deleted.
pub fn watch_path(
    target: &Path,
    key: String,
    tx: mpsc::Sender<String>,
) -> notify::Result<RecommendedWatcher> {
    let is_dir = target.is_dir();
    let file_name = target.file_name().map(ToOwned::to_owned);
    let (watch_root, mode) = if is_dir {
        (target.to_path_buf(), RecursiveMode::Recursive)
    } else {
        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        (parent, RecursiveMode::NonRecursive)
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else { return };
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        let relevant = is_dir
            || event
                .paths
                .iter()
                .any(|p| p.file_name() == file_name.as_deref());
        if relevant {
            let _ = tx.blocking_send(key.clone());
        }
    })?;
    watcher.watch(&watch_root, mode)?;
    debug!(path = %target.display(), root = %watch_root.display(), "Watching path");
    Ok(watcher)
}

/// Collapses bursts of change notifications per key.
///
/// Each notification pushes the key's deadline out to `now + settle`; a key
/// is due once its deadline passes without further notifications.
#[derive(Debug)]
pub struct Debouncer {
    settle: Duration,
    pending: HashMap<String, Instant>,
}

impl Debouncer {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            pending: HashMap::new(),
        }
    }

    pub fn touch(&mut self, key: String, now: Instant) {
        self.pending.insert(key, now + self.settle);
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return keys whose deadline has passed, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<(Instant, String)> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, key.clone()))
            .collect();
        due.sort();
        for (_, key) in &due {
            self.pending.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }
}
