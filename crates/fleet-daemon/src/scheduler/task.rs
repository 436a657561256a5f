//! Task definitions and their TOML store.

use std::path::{Path, PathBuf};

use fleet_core::{FileLock, LockOptions, persist};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::SchedulerError;

/// What makes a task fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Cron { schedule: String },
    FileWatch { path: PathBuf },
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Autonomous tasks run without waiting for approval.
    #[serde(default)]
    pub autonomous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

impl TaskDefinition {
    /// Batching key part; falls back to the task name.
    pub fn task_type(&self) -> &str {
        self.task_type.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<TaskDefinition>,
}

/// The task-definition file. Writers hold the file lock.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    lock: LockOptions,
}

impl TaskStore {
    pub const fn new(path: PathBuf, lock: LockOptions) -> Self {
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All definitions. A missing file holds no tasks.
    pub fn load(&self) -> Result<Vec<TaskDefinition>, SchedulerError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(fleet_core::Error::from(e).into()),
        };
        let file: TaskFile = toml::from_str(&content).map_err(|e| SchedulerError::TaskFile {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut seen = std::collections::HashSet::new();
        for task in &file.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(SchedulerError::DuplicateTask {
                    id: task.id.clone(),
                });
            }
        }
        Ok(file.tasks)
    }

    /// Insert `task`, replacing any definition with the same id.
    pub fn upsert(&self, task: TaskDefinition) -> Result<(), SchedulerError> {
        let _lock = FileLock::acquire(&self.path, &self.lock).map_err(fleet_core::Error::from)?;
        let mut tasks = self.load()?;
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        self.write(tasks)?;
        info!(task = %task.id, "Task definition saved");
        Ok(())
    }

    /// Remove the task with `id`. Returns whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool, SchedulerError> {
        let _lock = FileLock::acquire(&self.path, &self.lock).map_err(fleet_core::Error::from)?;
        let mut tasks = self.load()?;
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        if tasks.len() == before {
            return Ok(false);
        }
        self.write(tasks)?;
        info!(task = %id, "Task definition removed");
        Ok(true)
    }

    fn write(&self, tasks: Vec<TaskDefinition>) -> Result<(), SchedulerError> {
        let body = toml::to_string_pretty(&TaskFile { tasks }).map_err(|e| {
            SchedulerError::TaskFile {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;
        persist::write_atomic(&self.path, body.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cron_task(id: &str, schedule: &str) -> TaskDefinition {
        TaskDefinition {
            id: id.to_string(),
            name: format!("{id} task"),
            trigger: Trigger::Cron {
                schedule: schedule.to_string(),
            },
            payload: serde_json::json!({"report": id}),
            autonomous: true,
            task_type: None,
            tenant: Some("acme".to_string()),
        }
    }

    fn quick_lock() -> LockOptions {
        LockOptions {
            stale_after: Duration::from_secs(30),
            retry_interval: Duration::from_millis(10),
            retry_budget: Duration::from_millis(100),
        }
    }

    #[test]
    fn parses_toml_definitions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.toml");
        std::fs::write(
            &path,
            r#"
[[tasks]]
id = "inbox"
name = "Inbox triage"
task_type = "triage"
payload = { folder = "inbox" }

[tasks.trigger]
kind = "file_watch"
path = "/srv/inbox"

[[tasks]]
id = "daily"
name = "Daily digest"
autonomous = true
trigger = { kind = "cron", schedule = "0 9 * * *" }
"#,
        )
        .unwrap();

        let tasks = TaskStore::new(path, quick_lock()).load().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_type(), "triage");
        assert!(!tasks[0].autonomous);
        assert_eq!(tasks[0].payload["folder"], "inbox");
        assert_eq!(tasks[1].task_type(), "Daily digest");
        assert!(matches!(tasks[1].trigger, Trigger::Cron { ref schedule } if schedule == "0 9 * * *"));
    }

    #[test]
    fn upsert_replaces_by_id() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.toml"), quick_lock());

        store.upsert(cron_task("a", "0 * * * *")).unwrap();
        store.upsert(cron_task("b", "0 * * * *")).unwrap();
        store.upsert(cron_task("a", "*/5 * * * *")).unwrap();

        let tasks = store.load().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(
            tasks[0].trigger,
            Trigger::Cron {
                schedule: "*/5 * * * *".to_string()
            }
        );
        assert!(!FileLock::lock_path_for(store.path()).exists());
    }

    #[test]
    fn remove_reports_presence() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.toml"), quick_lock());
        store.upsert(cron_task("a", "@daily")).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.toml");
        let entry = "[[tasks]]\nid = \"x\"\nname = \"x\"\ntrigger = { kind = \"cron\", schedule = \"@daily\" }\n";
        std::fs::write(&path, format!("{entry}{entry}")).unwrap();
        let err = TaskStore::new(path, quick_lock()).load().unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask { id } if id == "x"));
    }

    #[test]
    fn upsert_fails_while_lock_is_held() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.toml"), quick_lock());
        let _held = FileLock::acquire(store.path(), &quick_lock()).unwrap();
        let err = store.upsert(cron_task("a", "@daily")).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Store(fleet_core::Error::Lock(_))
        ));
    }
}
