//! Request batching.
//!
//! Triggered tasks with the same `(task_type, tenant)` key are collected in a
//! bucket. A bucket is flushed once, either when it reaches the size limit
//! or when its window elapses, into a single combined executor call.

pub mod combine;
pub mod executor;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fleet_core::Config;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use combine::{BatchTask, TaskOutcome};
pub use executor::{BatchRequest, CommandTaskExecutor, TaskExecutor};

use crate::scheduler::TriggerEvent;

/// Errors from batching.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Task executor failed: {reason}")]
    ExecutorFailed { reason: String },
}

/// Batch window and size limit.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub window: Duration,
    pub max_batch_size: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            max_batch_size: 5,
        }
    }
}

impl BatchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window: Duration::from_secs(config.batch.window_secs),
            max_batch_size: config.batch.max_batch_size.max(1),
        }
    }
}

/// Bucket identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BucketKey {
    pub task_type: String,
    pub tenant: Option<String>,
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushReason {
    Size,
    Deadline,
    Forced,
}

/// Outcome of one flushed bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub key: BucketKey,
    pub reason: FlushReason,
    pub outcomes: BTreeMap<String, TaskOutcome>,
}

impl BatchReport {
    pub fn failures(&self) -> usize {
        self.outcomes.values().filter(|o| !o.is_success()).count()
    }
}

impl BatchTask {
    /// Batch entry for a fired task.
    pub fn from_trigger(event: &TriggerEvent) -> Self {
        let task = &event.task;
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            task_type: task.task_type().to_string(),
            tenant: task.tenant.clone(),
            payload: task.payload.clone(),
        }
    }

    fn key(&self) -> BucketKey {
        BucketKey {
            task_type: self.task_type.clone(),
            tenant: self.tenant.clone(),
        }
    }
}

struct Bucket {
    generation: u64,
    tasks: Vec<BatchTask>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    options: BatchOptions,
    executor: Arc<dyn TaskExecutor>,
    reports: mpsc::Sender<BatchReport>,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    next_generation: AtomicU64,
}

/// Groups tasks into combined executor calls.
#[derive(Clone)]
pub struct BatchExecutor {
    inner: Arc<Inner>,
}

impl BatchExecutor {
    pub fn new(
        options: BatchOptions,
        executor: Arc<dyn TaskExecutor>,
        reports: mpsc::Sender<BatchReport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                executor,
                reports,
                buckets: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(Vec::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Add a task to its bucket.
    ///
    /// A task whose id is already queued replaces the queued entry.
    pub async fn enqueue(&self, task: BatchTask) {
        let key = task.key();
        let mut buckets = self.inner.buckets.lock().await;
        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
            generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
            tasks: Vec::new(),
            timer: None,
        });

        match bucket.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => {
                debug!(task = %task.id, "Task already queued, replacing");
                *existing = task;
            }
            None => bucket.tasks.push(task),
        }
        debug!(?key, queued = bucket.tasks.len(), "Task enqueued");

        if bucket.tasks.len() >= self.inner.options.max_batch_size {
            if let Some(timer) = bucket.timer.take() {
                timer.abort();
            }
            if let Some(bucket) = buckets.remove(&key) {
                Inner::spawn_flush(&self.inner, key, bucket.tasks, FlushReason::Size).await;
            }
        } else if bucket.timer.is_none() {
            let inner = Arc::clone(&self.inner);
            let generation = bucket.generation;
            let window = self.inner.options.window;
            bucket.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                Inner::flush_generation(&inner, key, generation).await;
            }));
        }
    }

    /// Flush every pending bucket now and wait for all flushes to finish.
    ///
    /// Returns the number of buckets flushed by this call.
    pub async fn force_process(&self) -> usize {
        let count = {
            let mut buckets = self.inner.buckets.lock().await;
            let drained: Vec<_> = buckets.drain().collect();
            let count = drained.len();
            for (key, bucket) in drained {
                if let Some(timer) = bucket.timer {
                    timer.abort();
                }
                Inner::spawn_flush(&self.inner, key, bucket.tasks, FlushReason::Forced).await;
            }
            count
        };

        let handles: Vec<_> = self.inner.in_flight.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Batch flush task failed");
            }
        }
        count
    }

    /// Number of tasks waiting across all buckets.
    pub async fn pending(&self) -> usize {
        self.inner
            .buckets
            .lock()
            .await
            .values()
            .map(|b| b.tasks.len())
            .sum()
    }
}

impl Inner {
    /// Deadline flush. Does nothing if the bucket was already flushed.
    async fn flush_generation(inner: &Arc<Self>, key: BucketKey, generation: u64) {
        let mut buckets = inner.buckets.lock().await;
        let current = buckets.get(&key).is_some_and(|b| b.generation == generation);
        if !current {
            debug!(?key, generation, "Stale batch timer ignored");
            return;
        }
        if let Some(bucket) = buckets.remove(&key) {
            Self::spawn_flush(inner, key, bucket.tasks, FlushReason::Deadline).await;
        }
    }

    /// Start a flush task. Callers hold the bucket lock, so a flush is always
    /// registered before `force_process` can look for it.
    async fn spawn_flush(
        inner: &Arc<Self>,
        key: BucketKey,
        tasks: Vec<BatchTask>,
        reason: FlushReason,
    ) {
        let worker = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            let report = worker.run_flush(key, tasks, reason).await;
            if worker.reports.send(report).await.is_err() {
                warn!("Batch report receiver closed");
            }
        });
        let mut in_flight = inner.in_flight.lock().await;
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    async fn run_flush(
        &self,
        key: BucketKey,
        tasks: Vec<BatchTask>,
        reason: FlushReason,
    ) -> BatchReport {
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let request = BatchRequest {
            task_type: key.task_type.clone(),
            tenant: key.tenant.clone(),
            task_ids: ids.clone(),
            payload: combine::build_combined_payload(&key.task_type, key.tenant.as_deref(), &tasks),
        };
        info!(task_type = %key.task_type, tenant = ?key.tenant, tasks = ids.len(), ?reason, "Flushing batch");

        let outcomes = match self.executor.execute(&request).await {
            Ok(raw) => combine::parse_combined_result(&raw, &ids),
            Err(e) => {
                warn!(task_type = %key.task_type, error = %e, "Batch execution failed");
                ids.iter()
                    .map(|id| {
                        (
                            id.clone(),
                            TaskOutcome::Failure {
                                error: e.to_string(),
                                raw: None,
                            },
                        )
                    })
                    .collect()
            }
        };

        let report = BatchReport {
            key,
            reason,
            outcomes,
        };
        info!(
            task_type = %report.key.task_type,
            succeeded = report.outcomes.len() - report.failures(),
            failed = report.failures(),
            "Batch complete"
        );
        report
    }
}

/// Sends every task type's work through the batch executor as it arrives.
///
/// Tasks not marked autonomous are held for approval and only logged.
pub async fn dispatch_triggers(mut triggers: mpsc::Receiver<TriggerEvent>, batch: BatchExecutor) {
    while let Some(event) = triggers.recv().await {
        if !event.task.autonomous {
            info!(task = %event.task.id, reason = ?event.reason, "Task awaiting approval, not dispatched");
            continue;
        }
        batch.enqueue(BatchTask::from_trigger(&event)).await;
    }
    debug!("Trigger channel closed");
}
