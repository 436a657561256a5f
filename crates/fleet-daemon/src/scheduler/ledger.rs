//! Durable record of the last scheduled time each cron task fired for.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fleet_core::persist;

/// Task id to last fired scheduled time. Written before a fire is emitted.
#[derive(Debug)]
pub struct FireLedger {
    path: PathBuf,
    fired: BTreeMap<String, DateTime<Utc>>,
}

impl FireLedger {
    pub fn load(path: PathBuf) -> fleet_core::Result<Self> {
        let fired = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self { path, fired })
    }

    pub fn last_fired(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.fired.get(task_id).copied()
    }

    /// Record `at` for `task_id` and persist.
    pub fn record(&mut self, task_id: &str, at: DateTime<Utc>) -> fleet_core::Result<()> {
        self.fired.insert(task_id.to_string(), at);
        persist::write_json_atomic(&self.path, &self.fired)
    }
}
