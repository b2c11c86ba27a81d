#![forbid(unsafe_code)]

//! `pipeline-orchestrator` binary.
//!
//! `serve` runs the background services until a shutdown signal. The
//! other subcommands operate on one execution and exit; those that drive
//! an execution stay attached until it settles.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pipeline_orchestrator::app::AppState;
use pipeline_orchestrator::collaborators::Collaborators;
use pipeline_orchestrator::config::{span_days, GlobalConfig};
use pipeline_orchestrator::models::execution::{ExecutionMode, ExecutionSnapshot};
use pipeline_orchestrator::models::phase::PhaseName;
use pipeline_orchestrator::models::pipeline::{PipelineConfig, PipelineConfigOverride};
use pipeline_orchestrator::persistence::{db, retention, StateStore};
use pipeline_orchestrator::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pipeline-orchestrator", about = "Crash-recoverable pipeline orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler, health monitor, resumption and retention loops.
    Serve,
    /// Start a new execution.
    Start {
        /// JSON file holding the pipeline configuration.
        #[arg(long)]
        pipeline: Option<PathBuf>,
        /// Keyword to collect; repeatable, replaces the file's keywords.
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        /// Region code; repeatable, replaces the file's regions.
        #[arg(long = "region")]
        regions: Vec<String>,
        /// Shrink scope and skip retry delays.
        #[arg(long)]
        testing: bool,
        /// Print the id and exit instead of driving the execution.
        #[arg(long)]
        detach: bool,
    },
    /// Show one execution and its phases.
    Status {
        /// Execution id.
        id: String,
    },
    /// List recent executions.
    List {
        /// Maximum number of executions.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Cancel a running execution.
    Cancel {
        /// Execution id.
        id: String,
    },
    /// Continue an interrupted execution.
    Resume {
        /// Execution id.
        id: String,
        /// JSON file with overrides for phases that have not started.
        #[arg(long = "override")]
        config_override: Option<PathBuf>,
    },
    /// Reset one phase and continue the execution.
    RestartPhase {
        /// Execution id.
        id: String,
        /// Phase name, e.g. `content_analysis`.
        phase: PhaseName,
        /// Discard prior analyses before re-running analysis.
        #[arg(long)]
        fresh: bool,
    },
    /// Fail an execution and all of its unfinished phases.
    MarkFailed {
        /// Execution id.
        id: String,
    },
    /// Delete execution history.
    Purge {
        /// Delete this execution and everything it produced.
        #[arg(long, conflicts_with = "older_than_days")]
        id: Option<String>,
        /// Delete settled executions older than this many days.
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    info!(db_path = %config.db_path.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);

    if let Command::Purge { id, older_than_days } = &args.command {
        return purge(&db, id.as_deref(), *older_than_days, config.retention_days).await;
    }

    // Read-only commands need no collaborators.
    let store = StateStore::new(Arc::clone(&db));
    match &args.command {
        Command::Status { id } => return print_json(&snapshot(&store, id).await?),
        Command::List { limit } => {
            let mut snapshots = Vec::new();
            for execution in store.executions.list_recent(*limit).await? {
                snapshots.push(snapshot(&store, &execution.id).await?);
            }
            return print_json(&snapshots);
        }
        _ => {}
    }

    let collaborators = Collaborators::from_config(&config.providers)?;
    let state = AppState::build(config, db, &collaborators);

    match args.command {
        Command::Serve => serve(&state).await,
        Command::Start {
            pipeline,
            keywords,
            regions,
            testing,
            detach,
        } => {
            let mut pipeline = match pipeline {
                Some(path) => read_json::<PipelineConfig>(&path)?,
                None => PipelineConfig::default(),
            };
            if !keywords.is_empty() {
                pipeline.keywords = keywords;
            }
            if !regions.is_empty() {
                pipeline.regions = regions;
            }
            let mode = if testing || pipeline.testing_mode {
                pipeline.testing_mode = true;
                pipeline.testing_skip_delays = true;
                ExecutionMode::Testing
            } else {
                ExecutionMode::Manual
            };
            let id = state.orchestrator.start(pipeline, mode).await?;
            println!("{id}");
            if detach {
                // Dropping the runtime abandons the driver; resumption picks it up.
                return Ok(());
            }
            drive_until_settled(&state, &id).await
        }
        Command::Cancel { id } => {
            let cancelled = state.orchestrator.cancel(&id).await?;
            println!("{cancelled}");
            Ok(())
        }
        Command::Resume {
            id,
            config_override,
        } => {
            let patch = config_override
                .map(|path| read_json::<PipelineConfigOverride>(&path))
                .transpose()?;
            if state.orchestrator.resume(&id, patch.as_ref()).await? {
                drive_until_settled(&state, &id).await
            } else {
                warn!(execution_id = %id, "execution not resumed");
                print_json(&state.orchestrator.get_status(&id).await?)
            }
        }
        Command::RestartPhase { id, phase, fresh } => {
            let snapshot = state.orchestrator.restart_phase(&id, phase, fresh).await?;
            print_json(&snapshot)?;
            if state.orchestrator.is_attached(&id).await {
                drive_until_settled(&state, &id).await?;
            }
            Ok(())
        }
        Command::MarkFailed { id } => {
            state.orchestrator.mark_failed(&id).await?;
            print_json(&state.orchestrator.get_status(&id).await?)
        }
        Command::Status { .. } | Command::List { .. } | Command::Purge { .. } => Ok(()),
    }
}

async fn serve(state: &AppState) -> Result<()> {
    // ── Reattach interrupted executions ─────────────────
    match state.resumption.scan_once(Utc::now()).await {
        Ok(outcomes) => info!(
            candidates = outcomes.len(),
            resumed = outcomes.iter().filter(|o| o.resumed).count(),
            "startup resumption scan finished"
        ),
        Err(err) => error!(%err, "startup resumption scan failed"),
    }

    // ── Start background services ───────────────────────
    let ct = CancellationToken::new();
    let handles = state.spawn_background(&ct);
    info!(services = handles.len(), "pipeline orchestrator ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    for handle in handles {
        if let Err(err) = handle.await {
            error!(%err, "background task ended abnormally");
        }
    }
    state.orchestrator.shutdown().await;
    info!("pipeline orchestrator shut down");
    Ok(())
}

async fn drive_until_settled(state: &AppState, id: &str) -> Result<()> {
    let limit = Duration::from_secs(state.config.health.max_runtime_hours.saturating_mul(3600));
    tokio::select! {
        waited = state.orchestrator.wait_for_completion(id, limit) => {
            if waited?.is_none() {
                warn!(execution_id = id, "still running after the maximum runtime");
            }
        }
        () = shutdown_signal() => {
            info!(execution_id = id, "detaching; the execution can be resumed later");
            state.orchestrator.shutdown().await;
        }
    }
    print_json(&state.orchestrator.get_status(id).await?)
}

async fn snapshot(store: &StateStore, id: &str) -> Result<ExecutionSnapshot> {
    Ok(ExecutionSnapshot {
        execution: store.executions.require(id).await?,
        phases: store.phases.list_for_execution(id).await?,
        attached: false,
    })
}

async fn purge(
    db: &db::Database,
    id: Option<&str>,
    older_than_days: Option<u32>,
    retention_days: u32,
) -> Result<()> {
    if let Some(id) = id {
        let removed = retention::purge_execution(db, id).await?;
        if !removed {
            return Err(AppError::NotFound(format!("execution {id}")));
        }
        info!(execution_id = id, "execution purged");
        return Ok(());
    }
    let days = older_than_days.unwrap_or(retention_days);
    let cutoff = Utc::now() - span_days(u64::from(days));
    let purged = retention::purge_settled_before(db, cutoff).await?;
    info!(days, purged, "settled executions purged");
    println!("{purged}");
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", path.display())))?;
    Ok(serde_json::from_str(&raw)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
