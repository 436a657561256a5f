//! Configuration resolution for Fleet.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/fleet/config.toml)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged table-by-table before deserialization, so an overlay only
//! needs to name the keys it changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lock::LockOptions;
use crate::template::LaunchTemplate;

/// Complete Fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub tool_servers: ToolServerConfig,
    #[serde(default)]
    pub agents: AgentConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

/// Supervising daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root directory for state files. Defaults to `$XDG_STATE_HOME/fleet`.
    pub state_dir: Option<PathBuf>,
    /// Program run as the supervised child. Defaults to the current executable.
    pub child_command: Option<PathBuf>,
    pub child_args: Vec<String>,
    pub stop_timeout_secs: u64,
    pub restart_backoff_initial_ms: u64,
    pub restart_backoff_max_ms: u64,
    /// A child that stays up this long resets the backoff.
    pub stable_after_secs: u64,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            child_command: None,
            child_args: vec!["scheduler".to_string()],
            stop_timeout_secs: 10,
            restart_backoff_initial_ms: 1_000,
            restart_backoff_max_ms: 60_000,
            stable_after_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

/// Task scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tasks_path: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    /// Quiet period that collapses bursts of file events into one trigger.
    pub settle_ms: u64,
    /// How often cron schedules are evaluated.
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tasks_path: None,
            ledger_path: None,
            settle_ms: 500,
            tick_ms: 1_000,
        }
    }
}

/// Batch executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub window_secs: u64,
    pub max_batch_size: usize,
    /// External executor receiving combined batches on stdin.
    pub executor: Option<LaunchTemplate>,
    /// Longest a single executor run may take before it is killed.
    pub executor_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            max_batch_size: 5,
            executor: None,
            executor_timeout_secs: 600,
        }
    }
}

/// Tool-server manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolServerConfig {
    /// Manifest file, or directory of `*.toml` manifests.
    pub manifest_path: Option<PathBuf>,
    pub handshake_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            manifest_path: None,
            handshake_timeout_secs: 10,
            call_timeout_secs: 60,
            stop_timeout_secs: 5,
        }
    }
}

/// Sub-agent pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Launch templates keyed by agent role.
    pub templates: BTreeMap<String, LaunchTemplate>,
    pub terminate_timeout_secs: u64,
    /// How long records of ended agents are kept for inspection.
    pub retain_ended_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            templates: BTreeMap::new(),
            terminate_timeout_secs: 5,
            retain_ended_secs: 600,
        }
    }
}

/// Elastic scaling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub interval_secs: u64,
    pub state_path: Option<PathBuf>,
    /// Tool server answering demand metric queries.
    pub demand_server: Option<String>,
    pub demand_tool: String,
    pub rules: Vec<ScalingRule>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            state_path: None,
            demand_server: None,
            demand_tool: "get_metric".to_string(),
            rules: Vec::new(),
        }
    }
}

/// Policy mapping a demand metric to a desired number of agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRule {
    /// Key under which the rule's agents are tracked in the scaling state.
    pub key: String,
    pub metric: String,
    /// Demand strictly above this spawns agents.
    pub scale_up_threshold: f64,
    /// Demand at or below this retires the rule's agents.
    pub scale_down_threshold: f64,
    /// Agent template (role) to spawn.
    pub role: String,
    pub desired_count: usize,
    #[serde(default)]
    pub tenant: Option<String>,
    /// Minimum time between a scale-up and a following scale-down. Zero
    /// leaves the thresholds alone to decide.
    #[serde(default)]
    pub cooldown_secs: u64,
}

/// Advisory lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub stale_after_secs: u64,
    pub retry_interval_ms: u64,
    pub retry_budget_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30,
            retry_interval_ms: 50,
            retry_budget_ms: 5_000,
        }
    }
}

impl LockConfig {
    pub const fn options(&self) -> LockOptions {
        LockOptions {
            stale_after: Duration::from_secs(self.stale_after_secs),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            retry_budget: Duration::from_millis(self.retry_budget_ms),
        }
    }
}

impl Config {
    /// Parse a TOML document on top of the built-in defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Root state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.daemon
            .state_dir
            .clone()
            .or_else(default_state_dir)
            .unwrap_or_else(|| std::env::temp_dir().join("fleet"))
    }

    /// Daemon liveness state file.
    pub fn daemon_state_path(&self) -> PathBuf {
        self.state_dir().join("daemon.json")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.scheduler
            .tasks_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("tasks.toml"))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.scheduler
            .ledger_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("fire-ledger.json"))
    }

    pub fn scaling_state_path(&self) -> PathBuf {
        self.scaling
            .state_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("scaling.json"))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.tool_servers
            .manifest_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("servers.toml"))
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = toml::Table::new();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_tables(&mut merged, load_table(&global_path)?);
    }

    if let Some(path) = explicit {
        merge_tables(&mut merged, load_table(path)?);
    }

    let mut config: Config = toml::Value::Table(merged)
        .try_into()
        .map_err(|e: toml::de::Error| Error::Config(e.to_string()))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fleet").join("config.toml"))
}

/// Default state directory: `$XDG_STATE_HOME/fleet` or `~/.local/state/fleet`.
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("state")))
        .map(|p| p.join("fleet"))
}

fn load_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    content.parse::<toml::Table>().map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`; nested tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                merge_tables(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("FLEET_STATE_DIR") {
        config.daemon.state_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("FLEET_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = lookup("FLEET_TASKS_PATH") {
        config.scheduler.tasks_path = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("FLEET_BATCH_WINDOW_SECS").and_then(|v| v.parse().ok()) {
        config.batch.window_secs = n;
    }
    if let Some(n) = lookup("FLEET_BATCH_MAX_SIZE").and_then(|v| v.parse().ok()) {
        config.batch.max_batch_size = n;
    }
    if let Some(n) = lookup("FLEET_SCALING_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.scaling.interval_secs = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_batch_window_is_five_minutes() {
        let config = Config::default();
        assert_eq!(config.batch.window_secs, 300);
        assert_eq!(config.batch.max_batch_size, 5);
        assert_eq!(config.batch.executor_timeout_secs, 600);
    }

    #[test]
    fn default_lock_staleness_is_30s() {
        let config = Config::default();
        assert_eq!(config.lock.options().stale_after, Duration::from_secs(30));
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = Config::from_toml_str("[batch]\nmax_batch_size = 3\n").unwrap();
        assert_eq!(config.batch.max_batch_size, 3);
        assert_eq!(config.batch.window_secs, 300);
        assert_eq!(config.daemon.child_args, vec!["scheduler"]);
    }

    #[test]
    fn templates_and_rules_parse() {
        let config = Config::from_toml_str(
            r#"
[agents.templates.coder]
command = "agent-runner"
args = ["--role", "{role}"]
stdin = true

[[scaling.rules]]
key = "inbox"
metric = "queue_depth"
scale_up_threshold = 10.0
scale_down_threshold = 0.0
role = "coder"
desired_count = 3
"#,
        )
        .unwrap();
        assert!(config.agents.templates["coder"].stdin);
        assert_eq!(config.scaling.rules[0].desired_count, 3);
        assert_eq!(config.scaling.rules[0].cooldown_secs, 0);
    }

    #[test]
    fn explicit_file_merges_nested_tables() {
        let dir = TempDir::new().unwrap();
        let mut base: toml::Table = "[daemon]\nstop_timeout_secs = 3\nlog_level = \"debug\"\n"
            .parse()
            .unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[daemon]\nlog_level = \"warn\"\n").unwrap();
        merge_tables(&mut base, load_table(&path).unwrap());

        let config: Config = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.daemon.stop_timeout_secs, 3);
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| match key {
            "FLEET_BATCH_MAX_SIZE" => Some("9".to_string()),
            "FLEET_STATE_DIR" => Some("/var/lib/fleet".to_string()),
            "FLEET_BATCH_WINDOW_SECS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.batch.max_batch_size, 9);
        assert_eq!(config.batch.window_secs, 300);
        assert_eq!(config.tasks_path(), PathBuf::from("/var/lib/fleet/tasks.toml"));
    }

    #[test]
    fn missing_explicit_file_is_config_error() {
        let err = load_config(Some(Path::new("/nonexistent/fleet.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
