//! Advisory file locks for state shared between processes.
//!
//! A lock on `<file>` is a sidecar `<file>.lock` created with `create_new`.
//! It holds the owner's pid and a nonce so a holder never deletes a lock it
//! no longer owns. A lock whose mtime is older than
//! [`LockOptions::stale_after`] belongs to a crashed holder and is taken over.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

/// Default age after which a lock file is considered abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Timing knobs for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Lock files older than this are overridden.
    pub stale_after: Duration,
    /// Delay between acquisition attempts.
    pub retry_interval: Duration,
    /// Total time spent retrying before giving up.
    pub retry_budget: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            retry_interval: Duration::from_millis(50),
            retry_budget: Duration::from_secs(5),
        }
    }
}

/// Errors from lock acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock on {path} is held by another process (waited {waited:?})")]
    Contention { path: PathBuf, waited: Duration },

    #[error("Lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A held advisory lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
}

impl FileLock {
    /// Sidecar lock path for a guarded file.
    pub fn lock_path_for(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquire the lock guarding `target`, retrying within the budget.
    ///
    /// This blocks the calling thread between attempts.
    pub fn acquire(target: &Path, opts: &LockOptions) -> Result<Self, LockError> {
        let path = Self::lock_path_for(target);
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire_at(&path, opts.stale_after)? {
                return Ok(lock);
            }
            let waited = started.elapsed();
            if waited >= opts.retry_budget {
                return Err(LockError::Contention { path, waited });
            }
            std::thread::sleep(opts.retry_interval);
        }
    }

    /// Single acquisition attempt. Returns `None` while a live holder exists.
    pub fn try_acquire(target: &Path, stale_after: Duration) -> Result<Option<Self>, LockError> {
        Self::try_acquire_at(&Self::lock_path_for(target), stale_after)
    }

    fn try_acquire_at(path: &Path, stale_after: Duration) -> Result<Option<Self>, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let token = new_token();
                file.write_all(token.as_bytes()).map_err(io_err)?;
                debug!(path = %path.display(), "Acquired file lock");
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    token,
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if is_stale(path, stale_after) {
                    warn!(
                        path = %path.display(),
                        stale_after = ?stale_after,
                        "Overriding stale lock"
                    );
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                    return Self::try_acquire_at(path, stale_after);
                }
                Ok(None)
            }
            Err(e) => Err(io_err(e)),
        }
    }

    /// Path of the sidecar lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Someone may have overridden us as stale; leave their lock alone.
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content == self.token => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to release file lock");
                }
            }
            Ok(_) => {
                warn!(path = %self.path.display(), "Lock was taken over before release");
            }
            Err(_) => {}
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

fn new_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{} {nanos}", std::process::id())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quick_opts() -> LockOptions {
        LockOptions {
            stale_after: Duration::from_secs(30),
            retry_interval: Duration::from_millis(5),
            retry_budget: Duration::from_millis(50),
        }
    }

    #[test]
    fn lock_path_appends_suffix() {
        let path = FileLock::lock_path_for(Path::new("/tmp/tasks.toml"));
        assert_eq!(path, PathBuf::from("/tmp/tasks.toml.lock"));
    }

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.toml");

        let lock = FileLock::acquire(&target, &quick_opts()).unwrap();
        assert!(lock.path().exists());
        drop(lock);
        assert!(!FileLock::lock_path_for(&target).exists());
    }

    #[test]
    fn second_holder_hits_contention() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("scaling.json");

        let _held = FileLock::acquire(&target, &quick_opts()).unwrap();
        let err = FileLock::acquire(&target, &quick_opts()).unwrap_err();
        assert!(matches!(err, LockError::Contention { .. }));
    }

    #[test]
    fn stale_lock_is_overridden() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.toml");
        let lock_path = FileLock::lock_path_for(&target);

        // Leave behind a lock from a "crashed" holder, aged past the threshold.
        std::fs::write(&lock_path, "99999 0").unwrap();
        let file = std::fs::File::options().write(true).open(&lock_path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();
        drop(file);

        let lock = FileLock::acquire(&target, &quick_opts()).unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert!(content.starts_with(&std::process::id().to_string()));
    }

    #[test]
    fn fresh_foreign_lock_is_respected() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.toml");
        std::fs::write(FileLock::lock_path_for(&target), "99999 0").unwrap();

        let attempt = FileLock::try_acquire(&target, Duration::from_secs(30)).unwrap();
        assert!(attempt.is_none());
    }

    #[test]
    fn drop_leaves_taken_over_lock_in_place() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.toml");

        let lock = FileLock::acquire(&target, &quick_opts()).unwrap();
        std::fs::write(lock.path(), "12345 67").unwrap();
        drop(lock);
        assert!(FileLock::lock_path_for(&target).exists());
    }
}
