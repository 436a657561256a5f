//! Scaling state shared between processes: rule key to active agent ids.
//!
//! Next to the state file a second map records the pid of every listed
//! agent, so a process that did not spawn an agent can still tell whether
//! it is running and signal it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use fleet_core::{FileLock, LockOptions, persist};

/// Rule key to the agent ids it currently owns.
pub type ScalingState = BTreeMap<String, Vec<String>>;

/// Agent id to process id.
pub type AgentPids = BTreeMap<String, u32>;

/// JSON-backed [`ScalingState`], modified only under the file lock.
#[derive(Debug, Clone)]
pub struct ScalingStateStore {
    path: PathBuf,
    lock: LockOptions,
}

impl ScalingStateStore {
    pub const fn new(path: PathBuf, lock: LockOptions) -> Self {
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where agent pids are recorded: `scaling.json` keeps them in
    /// `scaling.pids.json`.
    pub fn pids_path(&self) -> PathBuf {
        self.path.with_extension("pids.json")
    }

    pub fn load(&self) -> fleet_core::Result<ScalingState> {
        Ok(persist::read_json(&self.path)?.unwrap_or_default())
    }

    pub fn load_pids(&self) -> fleet_core::Result<AgentPids> {
        Ok(persist::read_json(&self.pids_path())?.unwrap_or_default())
    }

    /// Take the file lock and read both maps. Nothing else can change the
    /// state until the returned value is dropped.
    pub fn lock(&self) -> fleet_core::Result<LockedScalingState> {
        let lock = FileLock::acquire(&self.path, &self.lock)?;
        let state = self.load()?;
        let pids = self.load_pids()?;
        Ok(LockedScalingState {
            store: self.clone(),
            saved_state: state.clone(),
            saved_pids: pids.clone(),
            state,
            pids,
            _lock: lock,
        })
    }

    /// Read-modify-write under the lock. The file is rewritten only if `f`
    /// changed the state.
    pub fn update<T>(&self, f: impl FnOnce(&mut ScalingState) -> T) -> fleet_core::Result<T> {
        let mut locked = self.lock()?;
        let out = f(&mut locked.state);
        locked.save()?;
        Ok(out)
    }

    /// Replace the ids recorded for `key`. An empty list removes the entry.
    pub fn set(&self, key: &str, ids: Vec<String>) -> fleet_core::Result<()> {
        self.update(|state| {
            state.insert(key.to_string(), ids);
        })
    }
}

/// Scaling state read under the file lock, which is held until drop.
pub struct LockedScalingState {
    store: ScalingStateStore,
    saved_state: ScalingState,
    saved_pids: AgentPids,
    pub state: ScalingState,
    pub pids: AgentPids,
    _lock: FileLock,
}

impl LockedScalingState {
    /// Write whatever changed since the last save. Empty entries are removed
    /// and pids are kept only for ids still listed.
    pub fn save(&mut self) -> fleet_core::Result<()> {
        self.state.retain(|_, ids| !ids.is_empty());
        let listed: HashSet<&String> = self.state.values().flatten().collect();
        self.pids.retain(|id, _| listed.contains(id));

        if self.state != self.saved_state {
            persist::write_json_atomic(&self.store.path, &self.state)?;
            self.saved_state.clone_from(&self.state);
        }
        if self.pids != self.saved_pids {
            persist::write_json_atomic(&self.store.pids_path(), &self.pids)?;
            self.saved_pids.clone_from(&self.pids);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn set_and_clear_entries() {
        let dir = TempDir::new().unwrap();
        let store = ScalingStateStore::new(dir.path().join("scaling.json"), LockOptions::default());

        store.set("queue", vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(store.load().unwrap()["queue"], vec!["a", "b"]);

        store.set("queue", Vec::new()).unwrap();
        assert!(store.load().unwrap().is_empty());
        assert!(!FileLock::lock_path_for(store.path()).exists());
    }

    #[test]
    fn file_is_a_plain_json_map() {
        let dir = TempDir::new().unwrap();
        let store = ScalingStateStore::new(dir.path().join("scaling.json"), LockOptions::default());
        store.set("support", vec!["x".into()]).unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"support": ["x"]}));
    }

    #[test]
    fn stale_lock_from_dead_writer_is_overridden() {
        use std::time::SystemTime;

        let dir = TempDir::new().unwrap();
        let store = ScalingStateStore::new(dir.path().join("scaling.json"), LockOptions::default());
        let lock_path = FileLock::lock_path_for(store.path());
        std::fs::write(&lock_path, "999999 0").unwrap();
        let old = SystemTime::now() - Duration::from_secs(120);
        std::fs::File::options()
            .write(true)
            .open(&lock_path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        store.set("queue", vec!["a".into()]).unwrap();
        assert_eq!(store.load().unwrap()["queue"], vec!["a"]);
    }

    #[test]
    fn pids_follow_the_listed_ids() {
        let dir = TempDir::new().unwrap();
        let store = ScalingStateStore::new(dir.path().join("scaling.json"), LockOptions::default());
        assert_eq!(store.pids_path(), dir.path().join("scaling.pids.json"));

        let mut locked = store.lock().unwrap();
        locked.state.insert("queue".into(), vec!["a".into(), "b".into()]);
        locked.pids.insert("a".into(), 100);
        locked.pids.insert("b".into(), 101);
        locked.save().unwrap();
        // Held until dropped.
        assert!(FileLock::try_acquire(store.path(), Duration::from_secs(30)).unwrap().is_none());
        drop(locked);

        assert_eq!(store.load_pids().unwrap().len(), 2);
        store.set("queue", vec!["b".into()]).unwrap();
        let pids = store.load_pids().unwrap();
        assert_eq!(pids.get("b"), Some(&101));
        assert!(!pids.contains_key("a"));
    }
}
