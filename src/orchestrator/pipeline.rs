//! Pipeline orchestrator: drives executions through their phases.
//!
//! Each attached execution has one driver task walking
//! [`PhaseName::ORDER`]. Every phase is moved pending→running before its
//! executor is invoked and running→completed|failed after it returns.
//! Completed phases are never re-run; phases left `running`, `failed` or
//! `blocked` by an earlier driver are reset to pending and re-run, which
//! is safe because executors are idempotent.
//!
//! The work-discovery monitor is started when scraping begins so analysis
//! overlaps scraping. The content-analysis step then signals that upstream
//! is complete and waits for the monitor to drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::work_discovery::{AnalysisContext, MonitorHandle, MonitorSummary, WorkDiscoveryMonitor};
use crate::config::{span_seconds, GlobalConfig};
use crate::models::execution::{
    Execution, ExecutionIssue, ExecutionMode, ExecutionSnapshot, ExecutionStatus,
};
use crate::models::phase::{PhaseName, PhaseSnapshot, PhaseState, PhaseStatus};
use crate::models::pipeline::{PipelineConfig, PipelineConfigOverride};
use crate::persistence::phase_repo::TransitionDetail;
use crate::persistence::StateStore;
use crate::phases::{PhaseContext, PhaseRegistry};
use crate::{AppError, Result};

/// Timing knobs for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// A running execution started this recently with the same
    /// configuration is returned instead of starting a duplicate.
    pub duplicate_window: chrono::Duration,
    /// Poll interval of [`Orchestrator::wait_for_completion`].
    pub completion_poll: Duration,
}

impl OrchestratorSettings {
    /// Derive settings from the `[orchestrator]` section.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            duplicate_window: span_seconds(config.orchestrator.duplicate_window_seconds),
            completion_poll: Duration::from_millis(config.orchestrator.completion_poll_ms),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&GlobalConfig::default())
    }
}

struct RunHandle {
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct MonitorSlot {
    handle: MonitorHandle,
    ctx: AnalysisContext,
    upstream_complete: bool,
}

/// Owns the lifecycle of every execution driven by this process.
pub struct Orchestrator {
    store: StateStore,
    phases: PhaseRegistry,
    monitor: WorkDiscoveryMonitor,
    settings: OrchestratorSettings,
    runs: Mutex<HashMap<String, RunHandle>>,
    monitors: Mutex<HashMap<String, MonitorSlot>>,
    start_lock: Mutex<()>,
    generation: AtomicU64,
}

impl Orchestrator {
    /// Create the orchestrator.
    #[must_use]
    pub fn new(
        store: StateStore,
        phases: PhaseRegistry,
        monitor: WorkDiscoveryMonitor,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            phases,
            monitor,
            settings,
            runs: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            start_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    /// Shared persistence.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Create and start a new execution.
    ///
    /// If another `running` execution was started within the duplicate
    /// window, its id is returned instead. Launches of different schedules
    /// never collapse into each other.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid configuration, or
    /// `AppError::Db` if persisting the execution fails.
    pub async fn start(self: &Arc<Self>, config: PipelineConfig, mode: ExecutionMode) -> Result<String> {
        config.validate()?;
        let _serialized = self.start_lock.lock().await;

        let since = Utc::now() - self.settings.duplicate_window;
        let recent = self.store.executions.list_running_since(since).await?;
        if let Some(existing) = recent
            .into_iter()
            .find(|e| e.config.schedule_id == config.schedule_id)
        {
            info!(execution_id = %existing.id, "duplicate start suppressed");
            return Ok(existing.id);
        }

        let execution = self
            .store
            .executions
            .create(&Execution::new(config, mode))
            .await?;
        self.store
            .phases
            .initialize(&execution.id, &PhaseName::ORDER)
            .await?;
        self.store
            .executions
            .transition_status(&execution.id, &[ExecutionStatus::Pending], ExecutionStatus::Running)
            .await?;
        info!(execution_id = %execution.id, mode = execution.mode.as_str(), "execution started");

        self.spawn_run(&execution.id).await;
        Ok(execution.id)
    }

    /// Continue an execution from its first phase that is not completed.
    ///
    /// Returns `false` when the execution is completed, cancelled or
    /// already being driven by this process. The override only touches
    /// phases that have not started.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution does not exist.
    pub async fn resume(
        self: &Arc<Self>,
        execution_id: &str,
        config_override: Option<&PipelineConfigOverride>,
    ) -> Result<bool> {
        let execution = self.store.executions.require(execution_id).await?;
        if matches!(
            execution.status,
            ExecutionStatus::Completed | ExecutionStatus::Cancelled
        ) {
            debug!(execution_id, status = execution.status.as_str(), "nothing to resume");
            return Ok(false);
        }
        if self.is_attached(execution_id).await {
            debug!(execution_id, "execution already attached");
            return Ok(false);
        }

        if let Some(patch) = config_override {
            let not_started: Vec<PhaseName> = self
                .store
                .phases
                .list_for_execution(execution_id)
                .await?
                .into_iter()
                .filter(|p| p.status == PhaseState::Pending)
                .map(|p| p.phase)
                .collect();
            let mut config = execution.config.clone();
            config.apply_override(patch, &not_started);
            self.store
                .executions
                .update_config(execution_id, &config)
                .await?;
        }

        self.store
            .executions
            .transition_status(
                execution_id,
                &[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    ExecutionStatus::Failed,
                    ExecutionStatus::Partial,
                ],
                ExecutionStatus::Running,
            )
            .await?;
        info!(execution_id, "execution resumed");
        self.spawn_run(execution_id).await;
        Ok(true)
    }

    /// Reset one phase to pending and continue the execution.
    ///
    /// With `fresh` on content analysis, every prior analysis of the
    /// execution is purged first. A completed, partial or failed
    /// execution goes back to `running`; a cancelled one only has the
    /// phase reset.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution or phase does not exist.
    pub async fn restart_phase(
        self: &Arc<Self>,
        execution_id: &str,
        phase: PhaseName,
        fresh: bool,
    ) -> Result<PhaseSnapshot> {
        let execution = self.store.executions.require(execution_id).await?;
        self.stop_run(execution_id).await;

        if fresh && phase == PhaseName::ContentAnalysis {
            let purged = self.store.content.purge_analyses(execution_id).await?;
            info!(execution_id, purged, "purged prior analyses for fresh restart");
        }
        let marker = fresh.then(|| serde_json::json!({ "fresh": true }));
        let snapshot = self.store.phases.reset(execution_id, phase, marker).await?;
        info!(execution_id, %phase, fresh, "phase reset to pending");

        if execution.status == ExecutionStatus::Cancelled {
            return Ok(snapshot);
        }
        self.store
            .executions
            .transition_status(
                execution_id,
                &[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    ExecutionStatus::Completed,
                    ExecutionStatus::Partial,
                    ExecutionStatus::Failed,
                ],
                ExecutionStatus::Running,
            )
            .await?;
        self.spawn_run(execution_id).await;
        Ok(snapshot)
    }

    /// Cancel a running execution.
    ///
    /// The driver and monitor are stopped and awaited before anything is
    /// written, so no further writes happen once this returns. Running
    /// phases become `blocked`. Returns `false` unless the execution was
    /// `running`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution does not exist.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        let execution = self.store.executions.require(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(false);
        }

        self.stop_run(execution_id).await;
        self.stop_monitor(execution_id).await;
        self.store
            .phases
            .force_status(
                execution_id,
                &[PhaseState::Running],
                PhaseState::Blocked,
                "execution cancelled",
            )
            .await?;

        match self
            .store
            .executions
            .transition_status(execution_id, &[ExecutionStatus::Running], ExecutionStatus::Cancelled)
            .await
        {
            Ok(_) => {
                info!(execution_id, "execution cancelled");
                Ok(true)
            }
            Err(AppError::InvalidTransition(reason)) => {
                debug!(execution_id, %reason, "execution settled before cancel");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Administrative override: fail the execution and every phase still
    /// pending, running or blocked.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution does not exist.
    pub async fn mark_failed(&self, execution_id: &str) -> Result<()> {
        let execution = self.store.executions.require(execution_id).await?;
        self.stop_run(execution_id).await;
        self.stop_monitor(execution_id).await;

        let reason = "marked failed by operator";
        self.store
            .phases
            .force_status(
                execution_id,
                &[PhaseState::Running, PhaseState::Pending, PhaseState::Blocked],
                PhaseState::Failed,
                reason,
            )
            .await?;
        if execution.status != ExecutionStatus::Failed {
            self.store
                .executions
                .transition_status(
                    execution_id,
                    &[
                        ExecutionStatus::Pending,
                        ExecutionStatus::Running,
                        ExecutionStatus::Completed,
                        ExecutionStatus::Cancelled,
                        ExecutionStatus::Partial,
                    ],
                    ExecutionStatus::Failed,
                )
                .await?;
        }
        self.store
            .executions
            .append_issue(execution_id, &ExecutionIssue::error(None, reason))
            .await?;
        warn!(execution_id, "execution marked failed");
        Ok(())
    }

    /// Latest committed state of an execution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution does not exist.
    pub async fn get_status(&self, execution_id: &str) -> Result<ExecutionSnapshot> {
        let execution = self.store.executions.require(execution_id).await?;
        self.snapshot(execution).await
    }

    /// Most recent executions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<ExecutionSnapshot>> {
        let executions = self.store.executions.list_recent(limit).await?;
        let mut out = Vec::with_capacity(executions.len());
        for execution in executions {
            out.push(self.snapshot(execution).await?);
        }
        Ok(out)
    }

    async fn snapshot(&self, execution: Execution) -> Result<ExecutionSnapshot> {
        let phases = self.store.phases.list_for_execution(&execution.id).await?;
        let attached = self.is_attached(&execution.id).await;
        Ok(ExecutionSnapshot {
            execution,
            phases,
            attached,
        })
    }

    /// Poll until the execution settles or `timeout` elapses.
    ///
    /// Returns `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution does not exist.
    pub async fn wait_for_completion(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<Option<Execution>> {
        let poll = async {
            loop {
                let execution = self.store.executions.require(execution_id).await?;
                if execution.status.is_settled() && !self.is_attached(execution_id).await {
                    return Ok::<_, AppError>(execution);
                }
                tokio::time::sleep(self.settings.completion_poll).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Whether this process is currently driving the execution.
    pub async fn is_attached(&self, execution_id: &str) -> bool {
        self.runs
            .lock()
            .await
            .get(execution_id)
            .is_some_and(|run| !run.join.is_finished())
    }

    /// Restart the work-discovery monitor of an execution, keeping its
    /// context. Returns `false` when no monitor is running for it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the stored context no longer validates.
    pub async fn restart_monitor(&self, execution_id: &str) -> Result<bool> {
        let mut monitors = self.monitors.lock().await;
        let Some(slot) = monitors.remove(execution_id) else {
            return Ok(false);
        };
        let MonitorSlot {
            handle,
            ctx,
            upstream_complete,
        } = slot;
        let summary = handle.stop_monitoring().await;
        let handle = self.monitor.start_monitoring(ctx.clone())?;
        if upstream_complete {
            handle.mark_upstream_complete();
        }
        monitors.insert(
            execution_id.to_owned(),
            MonitorSlot {
                handle,
                ctx,
                upstream_complete,
            },
        );
        info!(execution_id, analyzed = summary.analyzed, "work discovery restarted");
        Ok(true)
    }

    /// Stop the driver, complete the stuck phase, and continue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the phase is no longer running.
    pub async fn force_complete_phase(
        self: &Arc<Self>,
        execution_id: &str,
        phase: PhaseName,
        reason: &str,
    ) -> Result<()> {
        self.stop_run(execution_id).await;
        self.store
            .phases
            .transition_with(
                execution_id,
                phase,
                &[PhaseState::Running],
                PhaseState::Completed,
                Utc::now(),
                TransitionDetail::result(serde_json::json!({ "forced": reason })),
            )
            .await?;
        self.store
            .executions
            .append_issue(
                execution_id,
                &ExecutionIssue::warning(Some(phase), format!("completed by health monitor: {reason}")),
            )
            .await?;
        self.resume(execution_id, None).await?;
        Ok(())
    }

    /// Stop the driver and fail the stuck phase; the execution settles as
    /// partial or failed depending on whether it has viable data.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the phase is no longer running.
    pub async fn force_fail_phase(
        &self,
        execution_id: &str,
        phase: PhaseName,
        reason: &str,
    ) -> Result<ExecutionStatus> {
        self.stop_run(execution_id).await;
        self.stop_monitor(execution_id).await;
        self.store
            .phases
            .transition_with(
                execution_id,
                phase,
                &[PhaseState::Running],
                PhaseState::Failed,
                Utc::now(),
                TransitionDetail::error(reason),
            )
            .await?;
        let status = if self.store.content.has_viable_data(execution_id).await? {
            ExecutionStatus::Partial
        } else {
            ExecutionStatus::Failed
        };
        self.settle(execution_id, status, reason).await?;
        Ok(status)
    }

    /// Stop driving the execution and write a settled status, marking any
    /// phase still running as blocked.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the execution is no longer
    /// pending or running.
    pub async fn settle(&self, execution_id: &str, status: ExecutionStatus, reason: &str) -> Result<()> {
        self.stop_run(execution_id).await;
        self.stop_monitor(execution_id).await;
        self.store
            .phases
            .force_status(execution_id, &[PhaseState::Running], PhaseState::Blocked, reason)
            .await?;
        self.store
            .executions
            .transition_status(
                execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::Running],
                status,
            )
            .await?;
        let issue = if status == ExecutionStatus::Failed {
            ExecutionIssue::error(None, reason)
        } else {
            ExecutionIssue::warning(None, reason)
        };
        self.store.executions.append_issue(execution_id, &issue).await?;
        info!(execution_id, status = status.as_str(), reason, "execution settled");
        Ok(())
    }

    /// Stop every driver owned by this process, leaving state for the
    /// resumption service to pick up.
    pub async fn shutdown(&self) {
        let runs: Vec<(String, RunHandle)> = self.runs.lock().await.drain().collect();
        for (execution_id, run) in runs {
            run.cancel.cancel();
            if let Err(err) = run.join.await {
                warn!(execution_id, %err, "driver ended abnormally");
            }
        }
        let monitors: Vec<MonitorSlot> = self.monitors.lock().await.drain().map(|(_, s)| s).collect();
        for slot in monitors {
            slot.handle.stop_monitoring().await;
        }
    }

    async fn spawn_run(self: &Arc<Self>, execution_id: &str) {
        let mut runs = self.runs.lock().await;
        if runs
            .get(execution_id)
            .is_some_and(|run| !run.join.is_finished())
        {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let span = info_span!("pipeline_run", execution_id = %execution_id);
        let join = tokio::spawn(
            Arc::clone(self)
                .drive(execution_id.to_owned(), cancel.clone(), generation)
                .instrument(span),
        );
        runs.insert(
            execution_id.to_owned(),
            RunHandle {
                generation,
                cancel,
                join,
            },
        );
    }

    /// Cancel the driver and wait for it to exit. Returns whether one was
    /// attached.
    async fn stop_run(&self, execution_id: &str) -> bool {
        let run = self.runs.lock().await.remove(execution_id);
        match run {
            Some(run) => {
                run.cancel.cancel();
                if let Err(err) = run.join.await {
                    warn!(execution_id, %err, "driver ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    async fn stop_monitor(&self, execution_id: &str) -> Option<MonitorSummary> {
        let slot = self.monitors.lock().await.remove(execution_id)?;
        Some(slot.handle.stop_monitoring().await)
    }

    async fn drive(self: Arc<Self>, execution_id: String, cancel: CancellationToken, generation: u64) {
        let outcome = self.drive_phases(&execution_id, &cancel).await;
        self.stop_monitor(&execution_id).await;

        match outcome {
            Ok(status) => {
                match self
                    .store
                    .executions
                    .transition_status(&execution_id, &[ExecutionStatus::Running], status)
                    .await
                {
                    Ok(_) => info!(status = status.as_str(), "execution finished"),
                    Err(err) => warn!(%err, "could not record final status"),
                }
            }
            Err(AppError::Cancelled(_)) => debug!("driver stopped"),
            Err(err) => {
                error!(%err, "execution failed");
                let issue = ExecutionIssue::error(None, err.to_string());
                if let Err(db_err) = self.store.executions.append_issue(&execution_id, &issue).await {
                    warn!(%db_err, "could not record execution error");
                }
                if let Err(db_err) = self
                    .store
                    .executions
                    .transition_status(
                        &execution_id,
                        &[ExecutionStatus::Pending, ExecutionStatus::Running],
                        ExecutionStatus::Failed,
                    )
                    .await
                {
                    warn!(%db_err, "could not record failed status");
                }
            }
        }

        let mut runs = self.runs.lock().await;
        if runs
            .get(&execution_id)
            .is_some_and(|run| run.generation == generation)
        {
            runs.remove(&execution_id);
        }
    }

    async fn drive_phases(&self, execution_id: &str, cancel: &CancellationToken) -> Result<ExecutionStatus> {
        let config = self.store.executions.require(execution_id).await?.config;
        for phase in PhaseName::ORDER {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled(format!("{execution_id} stopped")));
            }
            self.run_phase(execution_id, phase, &config, cancel).await?;
        }
        self.final_status(execution_id).await
    }

    async fn final_status(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let phases = self.store.phases.list_for_execution(execution_id).await?;
        if phases.iter().all(|p| p.status == PhaseState::Completed) {
            return Ok(ExecutionStatus::Completed);
        }
        if self.store.content.has_viable_data(execution_id).await? {
            Ok(ExecutionStatus::Partial)
        } else {
            Ok(ExecutionStatus::Failed)
        }
    }

    /// Bring one phase to a resting state. Errors abort the whole driver:
    /// cancellation, persistence failures and critical phase failures.
    async fn run_phase(
        &self,
        execution_id: &str,
        phase: PhaseName,
        config: &PipelineConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(status) = self.prepare_phase(execution_id, phase).await? else {
            return Ok(());
        };
        self.store.executions.touch(execution_id, Utc::now()).await?;

        if !config.phase_enabled(phase) {
            self.begin(execution_id, phase).await?;
            self.finish(execution_id, phase, serde_json::json!({ "skipped": true }))
                .await?;
            debug!(%phase, "phase skipped");
            return Ok(());
        }

        if phase == PhaseName::ContentAnalysis {
            return self.run_analysis(execution_id, config, &status, cancel).await;
        }
        if phase == PhaseName::ContentScraping && config.phase_enabled(PhaseName::ContentAnalysis) {
            self.start_overlapping_analysis(execution_id, config).await?;
        }

        let Some(executor) = self.phases.get(phase) else {
            return self
                .fail_phase(execution_id, phase, AppError::Config(format!("no executor for {phase}")))
                .await;
        };

        self.begin(execution_id, phase).await?;
        let ctx = PhaseContext {
            execution_id: execution_id.to_owned(),
            phase,
            config: config.clone(),
            store: self.store.clone(),
            cancel: cancel.clone(),
        };
        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(AppError::Cancelled(format!("{phase} of {execution_id} stopped"))),
            outcome = executor.run(&ctx) => outcome,
        };

        match outcome {
            Ok(data) => self.finish(execution_id, phase, data).await,
            Err(err @ AppError::Cancelled(_)) => Err(err),
            Err(err) => self.fail_phase(execution_id, phase, err).await,
        }
    }

    /// Returns `None` when the phase is already completed; otherwise
    /// resets leftovers of an earlier driver to pending.
    async fn prepare_phase(&self, execution_id: &str, phase: PhaseName) -> Result<Option<PhaseStatus>> {
        let status = self.store.phases.get(execution_id, phase).await?;
        match status.status {
            PhaseState::Completed => Ok(None),
            PhaseState::Pending => Ok(Some(status)),
            PhaseState::Running | PhaseState::Failed | PhaseState::Blocked => {
                debug!(%phase, from = status.status.as_str(), "resetting orphaned phase");
                let marker = status
                    .fresh_requested()
                    .then(|| serde_json::json!({ "fresh": true }));
                self.store
                    .phases
                    .reset(execution_id, phase, marker)
                    .await
                    .map(Some)
            }
        }
    }

    async fn begin(&self, execution_id: &str, phase: PhaseName) -> Result<()> {
        self.store
            .phases
            .transition(execution_id, phase, &[PhaseState::Pending], PhaseState::Running, Utc::now())
            .await?;
        info!(%phase, "phase started");
        Ok(())
    }

    async fn finish(&self, execution_id: &str, phase: PhaseName, data: serde_json::Value) -> Result<()> {
        match self
            .store
            .phases
            .transition_with(
                execution_id,
                phase,
                &[PhaseState::Running],
                PhaseState::Completed,
                Utc::now(),
                TransitionDetail::result(data),
            )
            .await
        {
            Ok(_) => {
                info!(%phase, "phase completed");
                Ok(())
            }
            Err(AppError::InvalidTransition(reason)) => {
                warn!(%phase, %reason, "phase changed underneath the driver");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn fail_phase(&self, execution_id: &str, phase: PhaseName, err: AppError) -> Result<()> {
        warn!(%phase, %err, "phase failed");
        let message = err.to_string();
        let current = self.store.phases.get(execution_id, phase).await?;
        if current.status == PhaseState::Pending {
            // Failures are only recorded from running.
            self.begin(execution_id, phase).await?;
        }
        match self
            .store
            .phases
            .transition_with(
                execution_id,
                phase,
                &[PhaseState::Running],
                PhaseState::Failed,
                Utc::now(),
                TransitionDetail::error(message.clone()),
            )
            .await
        {
            Ok(_) => {}
            Err(AppError::InvalidTransition(reason)) => {
                warn!(%phase, %reason, "phase changed underneath the driver");
            }
            Err(db_err) => return Err(db_err),
        }
        self.store
            .executions
            .append_issue(execution_id, &ExecutionIssue::error(Some(phase), message))
            .await?;

        if phase.is_critical() {
            return Err(err);
        }
        Ok(())
    }

    async fn start_overlapping_analysis(&self, execution_id: &str, config: &PipelineConfig) -> Result<()> {
        let analysis = self
            .store
            .phases
            .get(execution_id, PhaseName::ContentAnalysis)
            .await?;
        if analysis.status == PhaseState::Completed {
            return Ok(());
        }
        match self
            .ensure_monitor(execution_id, config, analysis.fresh_requested())
            .await
        {
            Err(AppError::Config(reason)) => {
                debug!(%reason, "analysis cannot overlap scraping");
                Ok(())
            }
            other => other,
        }
    }

    async fn ensure_monitor(&self, execution_id: &str, config: &PipelineConfig, fresh: bool) -> Result<()> {
        let mut monitors = self.monitors.lock().await;
        if monitors.contains_key(execution_id) {
            return Ok(());
        }
        let ctx = AnalysisContext::from_pipeline(execution_id, config, fresh);
        let handle = self.monitor.start_monitoring(ctx.clone())?;
        monitors.insert(
            execution_id.to_owned(),
            MonitorSlot {
                handle,
                ctx,
                upstream_complete: false,
            },
        );
        Ok(())
    }

    async fn run_analysis(
        &self,
        execution_id: &str,
        config: &PipelineConfig,
        status: &PhaseStatus,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let phase = PhaseName::ContentAnalysis;
        match self
            .ensure_monitor(execution_id, config, status.fresh_requested())
            .await
        {
            Ok(()) => {}
            Err(AppError::Config(reason)) => {
                warn!(%reason, "analysis not started");
                self.store
                    .executions
                    .append_issue(execution_id, &ExecutionIssue::error(Some(phase), reason))
                    .await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        self.begin(execution_id, phase).await?;

        let poll = self.monitor.settings().tick.min(self.settings.completion_poll);
        let summary = loop {
            let drained = {
                let mut monitors = self.monitors.lock().await;
                match monitors.get_mut(execution_id) {
                    Some(slot) => {
                        slot.upstream_complete = true;
                        slot.handle.mark_upstream_complete();
                        if slot.handle.is_finished() {
                            monitors.remove(execution_id)
                        } else {
                            None
                        }
                    }
                    None => break MonitorSummary::default(),
                }
            };
            if let Some(mut slot) = drained {
                break slot.handle.wait_for_drain().await?;
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!("{phase} of {execution_id} stopped")));
                }
                () = tokio::time::sleep(poll) => {}
            }
        };

        if summary.analyzed == 0 && summary.failed > 0 {
            return self
                .fail_phase(
                    execution_id,
                    phase,
                    AppError::Transient(format!("all {} analyzed items failed", summary.failed)),
                )
                .await;
        }
        let analyses = self.store.content.count_analyses(execution_id).await?;
        self.finish(
            execution_id,
            phase,
            serde_json::json!({
                "analyzed": summary.analyzed,
                "failed": summary.failed,
                "batches": summary.batches,
                "analyses": analyses,
            }),
        )
        .await
    }
}
