//! `fleetd`
//!
//! Runs one of the fleet roles: the supervising daemon, the task scheduler
//! it keeps alive, or the elastic scaling loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleet_core::Config;
use fleet_daemon::agents::{AgentPool, ElasticScalingEngine, ScalingStateStore, ToolDemandSource};
use fleet_daemon::batch::{
    BatchExecutor, BatchOptions, BatchReport, CommandTaskExecutor, dispatch_triggers,
};
use fleet_daemon::scheduler::{SchedulerOptions, TaskScheduler};
use fleet_daemon::supervisor::{SupervisingDaemon, SupervisorOptions};
use fleet_daemon::toolserver::{ManagerOptions, ToolServerManager, ToolServerRegistry};

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(version, about = "Fleet process orchestration daemon")]
struct Args {
    /// Configuration file, merged over the global one
    #[arg(long, global = true, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn"). Overrides the config.
    #[arg(long, global = true, env = "FLEET_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "FLEET_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Mode {
    /// Keep the scheduler running, restarting it when it crashes
    Supervise,
    /// Fire cron and file-watch tasks and execute them in batches
    Scheduler,
    /// Scale agent groups up and down with demand
    Scale,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = fleet_core::config::load_config(args.config.as_deref())?;

    let level = args.log_level.as_deref().unwrap_or(&config.daemon.log_level);
    let log_filter = format!("fleet_daemon={level},fleet_core={level}");
    fleet_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?args.mode,
        state_dir = %config.state_dir().display(),
        "Starting fleetd"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handle: JoinHandle<anyhow::Result<()>> = match args.mode {
        Mode::Supervise => spawn_supervisor(&config, &args, shutdown_rx)?,
        Mode::Scheduler => spawn_scheduler(&config, shutdown_rx)?,
        Mode::Scale => spawn_scaling(&config, shutdown_rx)?,
    };

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let finished = tokio::select! {
        result = &mut handle => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            None
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            None
        }
    };

    let result = match finished {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(true);
            handle.await
        }
    };
    result.context("fleetd task panicked")??;

    info!("fleetd stopped");
    Ok(())
}

fn spawn_supervisor(
    config: &Config,
    args: &Args,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    let options = if config.daemon.child_command.is_some() {
        SupervisorOptions::from_config(config, PathBuf::new())
    } else {
        let exe = std::env::current_exe().context("Cannot locate the fleetd executable")?;
        let mut options = SupervisorOptions::from_config(config, exe);
        // The child re-reads the same configuration and log settings.
        let mut inherited = Vec::new();
        if let Some(path) = &args.config {
            inherited.push("--config".to_string());
            inherited.push(path.display().to_string());
        }
        if let Some(level) = &args.log_level {
            inherited.push("--log-level".to_string());
            inherited.push(level.clone());
        }
        if args.log_json {
            inherited.push("--log-json".to_string());
        }
        inherited.append(&mut options.args);
        options.args = inherited;
        options
    };

    info!(
        command = %options.command.display(),
        args = ?options.args,
        state = %options.state_path.display(),
        "Supervising child"
    );
    let daemon = SupervisingDaemon::new(options);
    Ok(tokio::spawn(async move {
        let state = daemon.run(shutdown).await?;
        info!(restarts = state.restart_count, "Supervisor finished");
        Ok(())
    }))
}

fn spawn_scheduler(
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    let template = config
        .batch
        .executor
        .clone()
        .context("[batch.executor] must name the command that runs task batches")?;

    let (trigger_tx, trigger_rx) = mpsc::channel(256);
    let (report_tx, report_rx) = mpsc::channel(64);

    let batch = BatchExecutor::new(
        BatchOptions::from_config(config),
        Arc::new(CommandTaskExecutor::new(
            template,
            Duration::from_secs(config.batch.executor_timeout_secs.max(1)),
        )),
        report_tx,
    );
    let scheduler = TaskScheduler::new(SchedulerOptions::from_config(config), trigger_tx)?;

    let dispatcher = tokio::spawn(dispatch_triggers(trigger_rx, batch.clone()));
    let reporter = tokio::spawn(log_reports(report_rx));

    Ok(tokio::spawn(async move {
        let result = scheduler.run(shutdown).await;
        // The scheduler dropped its sender; drain what was already queued.
        let _ = dispatcher.await;
        let flushed = batch.force_process().await;
        if flushed > 0 {
            info!(batches = flushed, "Flushed pending batches on shutdown");
        }
        drop(batch);
        let _ = reporter.await;
        result.map_err(Into::into)
    }))
}

async fn log_reports(mut reports: mpsc::Receiver<BatchReport>) {
    while let Some(report) = reports.recv().await {
        debug!(
            task_type = %report.key.task_type,
            reason = ?report.reason,
            failures = report.failures(),
            "Batch report received"
        );
        for (id, outcome) in &report.outcomes {
            if !outcome.is_success() {
                warn!(task_id = %id, outcome = ?outcome, "Task failed");
            }
        }
    }
}

fn spawn_scaling(
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    let server = config
        .scaling
        .demand_server
        .clone()
        .context("[scaling] demand_server must name the tool server that reports demand")?;

    let registry = ToolServerRegistry::load(&config.manifest_path())?;
    if registry.get(&server).is_none() {
        anyhow::bail!("Demand server '{server}' is not in the tool-server manifest");
    }
    let manager = Arc::new(ToolServerManager::new(
        &registry,
        ManagerOptions::from(&config.tool_servers),
    ));
    let demand = Arc::new(ToolDemandSource::new(
        Arc::clone(&manager),
        &server,
        &config.scaling.demand_tool,
    ));
    let pool = Arc::new(AgentPool::from_config(&config.agents));
    for rule in &config.scaling.rules {
        if !pool.roles().any(|role| role == rule.role) {
            error!(rule = %rule.key, role = %rule.role, "Rule names an unknown agent role");
        }
    }
    let store = ScalingStateStore::new(config.scaling_state_path(), config.lock.options());
    let engine = ElasticScalingEngine::new(config.scaling.rules.clone(), pool, demand, store);
    let interval = Duration::from_secs(config.scaling.interval_secs.max(1));

    Ok(tokio::spawn(async move {
        engine.run(interval, shutdown).await;
        manager.stop_all().await;
        Ok(())
    }))
}
