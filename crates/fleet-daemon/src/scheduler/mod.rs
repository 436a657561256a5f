//! Trigger-based task scheduler.
//!
//! Loads task definitions from a TOML file (reloading it whenever it changes),
//! fires cron triggers once per scheduled time and file-watch triggers once
//! per settled burst of changes. Fired tasks are emitted as
//! [`TriggerEvent`]s on a channel.

pub mod cron;
pub mod ledger;
pub mod task;
pub mod watch;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::{Config, LockOptions};
use notify::RecommendedWatcher;
use tokio::sync::{mpsc, watch as shutdown_watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use cron::{CronError, CronExpr};
pub use ledger::FireLedger;
pub use task::{TaskDefinition, TaskStore, Trigger};
pub use watch::Debouncer;

/// Debounce key used for the task-definition file itself.
const RELOAD_KEY: &str = "\0tasks";

/// Errors from the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid task file {path}: {reason}")]
    TaskFile { path: PathBuf, reason: String },

    #[error("Task id '{id}' is defined more than once")]
    DuplicateTask { id: String },

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Store(#[from] fleet_core::Error),
}

/// Why a task fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerReason {
    /// Cron fire for this scheduled time.
    Cron { scheduled: DateTime<Utc> },
    /// The watched path changed.
    FileChange { path: PathBuf },
}

/// A task whose trigger condition became true.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub task: TaskDefinition,
    pub reason: TriggerReason,
    pub fired_at: DateTime<Utc>,
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tasks_path: PathBuf,
    pub ledger_path: PathBuf,
    pub settle: Duration,
    pub tick: Duration,
    pub lock: LockOptions,
}

impl SchedulerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tasks_path: config.tasks_path(),
            ledger_path: config.ledger_path(),
            settle: Duration::from_millis(config.scheduler.settle_ms),
            tick: Duration::from_millis(config.scheduler.tick_ms),
            lock: config.lock.options(),
        }
    }
}

struct ScheduledTask {
    definition: TaskDefinition,
    cron: Option<CronExpr>,
}

pub struct TaskScheduler {
    options: SchedulerOptions,
    store: TaskStore,
    ledger: FireLedger,
    tasks: Vec<ScheduledTask>,
    watchers: HashMap<String, RecommendedWatcher>,
    debouncer: Debouncer,
    events: mpsc::Sender<TriggerEvent>,
}

impl TaskScheduler {
    pub fn new(
        options: SchedulerOptions,
        events: mpsc::Sender<TriggerEvent>,
    ) -> Result<Self, SchedulerError> {
        let store = TaskStore::new(options.tasks_path.clone(), options.lock);
        let ledger = FireLedger::load(options.ledger_path.clone())?;
        let debouncer = Debouncer::new(options.settle);
        Ok(Self {
            options,
            store,
            ledger,
            tasks: Vec::new(),
            watchers: HashMap::new(),
            debouncer,
            events,
        })
    }

    pub const fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Ids of the currently loaded tasks.
    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .map(|t| t.definition.id.as_str())
            .collect()
    }

    /// Re-read the task file and rebuild cron schedules.
    ///
    /// Tasks with an invalid cron expression are skipped with a warning. On a
    /// parse failure of the whole file the previous set stays active.
    pub fn reload(&mut self) -> Result<(), SchedulerError> {
        let definitions = self.store.load()?;
        let now = Utc::now();
        let mut tasks = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let cron = match &definition.trigger {
                Trigger::Cron { schedule } => match CronExpr::parse(schedule) {
                    Ok(cron) => {
                        debug!(task = %definition.id, next = ?cron.next_after(now), "Cron task loaded");
                        Some(cron)
                    }
                    Err(e) => {
                        warn!(task = %definition.id, error = %e, "Skipping task");
                        continue;
                    }
                },
                Trigger::FileWatch { .. } => None,
            };
            tasks.push(ScheduledTask { definition, cron });
        }
        info!(tasks = tasks.len(), path = %self.store.path().display(), "Task definitions loaded");
        self.tasks = tasks;
        Ok(())
    }

    /// Replace file watchers with one per file-watch task.
    fn rewatch(&mut self, tx: &mpsc::Sender<String>) {
        self.watchers.clear();
        for task in &self.tasks {
            if let Trigger::FileWatch { path } = &task.definition.trigger {
                match watch::watch_path(path, task.definition.id.clone(), tx.clone()) {
                    Ok(watcher) => {
                        self.watchers.insert(task.definition.id.clone(), watcher);
                    }
                    Err(e) => {
                        warn!(task = %task.definition.id, path = %path.display(), error = %e, "Cannot watch path");
                    }
                }
            }
        }
    }

    /// Cron fires due at `now`, in scheduled-time order.
    ///
    /// Each fire is recorded in the ledger before it is returned. After an
    /// outage only the latest missed time fires. A task seen for the first
    /// time is baselined at `now` and does not fire for past times.
    pub fn due_cron_fires(&mut self, now: DateTime<Utc>) -> Result<Vec<TriggerEvent>, SchedulerError> {
        let mut due = Vec::new();
        for task in &self.tasks {
            let Some(cron) = &task.cron else { continue };
            let id = &task.definition.id;
            let Some(last) = self.ledger.last_fired(id) else {
                self.ledger.record(id, now)?;
                continue;
            };
            if let Some(scheduled) = cron.latest_at_or_before(now)
                && scheduled > last
            {
                due.push((scheduled, task.definition.clone()));
            }
        }

        due.sort_by_key(|(scheduled, _)| *scheduled);
        let mut events = Vec::with_capacity(due.len());
        for (scheduled, task) in due {
            self.ledger.record(&task.id, scheduled)?;
            info!(task = %task.id, %scheduled, "Cron trigger fired");
            events.push(TriggerEvent {
                task,
                reason: TriggerReason::Cron { scheduled },
                fired_at: now,
            });
        }
        Ok(events)
    }

    fn file_fire(&self, task_id: &str) -> Option<TriggerEvent> {
        let task = self.tasks.iter().find(|t| t.definition.id == task_id)?;
        let Trigger::FileWatch { path } = &task.definition.trigger else {
            return None;
        };
        info!(task = %task_id, path = %path.display(), "File trigger fired");
        Some(TriggerEvent {
            task: task.definition.clone(),
            reason: TriggerReason::FileChange { path: path.clone() },
            fired_at: Utc::now(),
        })
    }

    /// Run until shutdown, emitting trigger events.
    pub async fn run(
        mut self,
        mut shutdown: shutdown_watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        let (change_tx, mut change_rx) = mpsc::channel::<String>(256);

        if let Some(parent) = self.options.tasks_path.parent() {
            std::fs::create_dir_all(parent).map_err(fleet_core::Error::from)?;
        }
        self.reload()?;
        self.rewatch(&change_tx);
        let _reload_watcher =
            watch::watch_path(&self.options.tasks_path, RELOAD_KEY.to_string(), change_tx.clone())?;

        let mut tick = tokio::time::interval(self.options.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let next_settle = self.debouncer.next_deadline();
            let mut fired = Vec::new();

            tokio::select! {
                _ = tick.tick() => {
                    fired = self.due_cron_fires(Utc::now())?;
                }
                Some(key) = change_rx.recv() => {
                    self.debouncer.touch(key, Instant::now());
                }
                () = sleep_until_opt(next_settle), if next_settle.is_some() => {
                    for key in self.debouncer.take_due(Instant::now()) {
                        if key == RELOAD_KEY {
                            match self.reload() {
                                Ok(()) => self.rewatch(&change_tx),
                                Err(e) => error!(error = %e, "Task reload failed, keeping previous tasks"),
                            }
                        } else if let Some(event) = self.file_fire(&key) {
                            fired.push(event);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Scheduler shutting down");
                    return Ok(());
                }
            }

            for event in fired {
                if self.events.send(event).await.is_err() {
                    warn!("Trigger receiver closed, stopping scheduler");
                    return Ok(());
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn scheduler(dir: &TempDir) -> (TaskScheduler, mpsc::Receiver<TriggerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let options = SchedulerOptions {
            tasks_path: dir.path().join("tasks.toml"),
            ledger_path: dir.path().join("fire-ledger.json"),
            settle: Duration::from_millis(50),
            tick: Duration::from_millis(50),
            lock: LockOptions::default(),
        };
        (TaskScheduler::new(options, tx).unwrap(), rx)
    }

    fn write_tasks(dir: &TempDir, body: &str) {
        std::fs::write(dir.path().join("tasks.toml"), body).unwrap();
    }

    const HOURLY: &str = r#"
[[tasks]]
id = "hourly"
name = "Hourly sync"
autonomous = true
trigger = { kind = "cron", schedule = "0 * * * *" }
"#;

    #[test]
    fn first_sight_is_baselined_then_fires_once_per_time() {
        let dir = TempDir::new().unwrap();
        write_tasks(&dir, HOURLY);
        let (mut scheduler, _rx) = scheduler(&dir);
        scheduler.reload().unwrap();

        assert!(scheduler.due_cron_fires(at("2026-03-01T10:30:00Z")).unwrap().is_empty());
        assert!(scheduler.due_cron_fires(at("2026-03-01T10:59:00Z")).unwrap().is_empty());

        let fires = scheduler.due_cron_fires(at("2026-03-01T11:00:05Z")).unwrap();
        assert_eq!(fires.len(), 1);
        assert_eq!(
            fires[0].reason,
            TriggerReason::Cron {
                scheduled: at("2026-03-01T11:00:00Z")
            }
        );
        assert!(scheduler.due_cron_fires(at("2026-03-01T11:00:30Z")).unwrap().is_empty());
    }

    #[test]
    fn catch_up_fires_only_latest_and_survives_restart() {
        let dir = TempDir::new().unwrap();
        write_tasks(&dir, HOURLY);
        {
            let (mut scheduler, _rx) = scheduler(&dir);
            scheduler.reload().unwrap();
            scheduler.due_cron_fires(at("2026-03-01T10:30:00Z")).unwrap();
        }

        // Restarted after a five hour outage.
        let (mut scheduler, _rx) = scheduler(&dir);
        scheduler.reload().unwrap();
        let fires = scheduler.due_cron_fires(at("2026-03-01T15:10:00Z")).unwrap();
        assert_eq!(fires.len(), 1);
        assert_eq!(
            fires[0].reason,
            TriggerReason::Cron {
                scheduled: at("2026-03-01T15:00:00Z")
            }
        );

        // And again: nothing is fired twice.
        let (mut scheduler, _rx) = self::scheduler(&dir);
        scheduler.reload().unwrap();
        assert!(scheduler.due_cron_fires(at("2026-03-01T15:20:00Z")).unwrap().is_empty());
    }

    #[test]
    fn invalid_cron_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_tasks(
            &dir,
            &format!(
                "{HOURLY}\n[[tasks]]\nid = \"bad\"\nname = \"bad\"\ntrigger = {{ kind = \"cron\", schedule = \"nope\" }}\n"
            ),
        );
        let (mut scheduler, _rx) = scheduler(&dir);
        scheduler.reload().unwrap();
        assert_eq!(scheduler.task_ids(), vec!["hourly"]);
    }

    #[test]
    fn simultaneous_fires_are_ordered_by_schedule() {
        let dir = TempDir::new().unwrap();
        write_tasks(
            &dir,
            r#"
[[tasks]]
id = "late"
name = "late"
trigger = { kind = "cron", schedule = "30 10 * * *" }

[[tasks]]
id = "early"
name = "early"
trigger = { kind = "cron", schedule = "15 10 * * *" }
"#,
        );
        let (mut scheduler, _rx) = scheduler(&dir);
        scheduler.reload().unwrap();
        scheduler.due_cron_fires(at("2026-03-01T10:00:00Z")).unwrap();
        let fires = scheduler.due_cron_fires(at("2026-03-01T10:45:00Z")).unwrap();
        let ids: Vec<_> = fires.iter().map(|f| f.task.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_watch_task_fires_after_settle() {
        let dir = TempDir::new().unwrap();
        let inbox = dir.path().join("inbox");
        std::fs::create_dir(&inbox).unwrap();
        write_tasks(
            &dir,
            &format!(
                "[[tasks]]\nid = \"inbox\"\nname = \"Inbox\"\nautonomous = true\ntrigger = {{ kind = \"file_watch\", path = \"{}\" }}\n",
                inbox.display()
            ),
        );

        let (scheduler, mut rx) = scheduler(&dir);
        let (shutdown_tx, shutdown_rx) = shutdown_watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        // Give the watcher time to register.
        tokio::time::sleep(Duration::from_millis(200)).await;
        for i in 0..3 {
            std::fs::write(inbox.join(format!("mail-{i}.eml")), "hi").unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.task.id, "inbox");
        assert_eq!(event.reason, TriggerReason::FileChange { path: inbox });

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn task_file_changes_are_hot_reloaded() {
        let dir = TempDir::new().unwrap();
        let inbox = dir.path().join("drop");
        std::fs::create_dir(&inbox).unwrap();

        let (scheduler, mut rx) = scheduler(&dir);
        let store = scheduler.store().clone();
        let (shutdown_tx, shutdown_rx) = shutdown_watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        store
            .upsert(TaskDefinition {
                id: "drop".into(),
                name: "Drop folder".into(),
                trigger: Trigger::FileWatch { path: inbox.clone() },
                payload: serde_json::Value::Null,
                autonomous: true,
                task_type: None,
                tenant: None,
            })
            .unwrap();
        // Reload settles, then the new watcher is in place.
        tokio::time::sleep(Duration::from_millis(500)).await;
        std::fs::write(inbox.join("file.txt"), "x").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.task.id, "drop");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
