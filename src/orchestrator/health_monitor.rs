//! Health monitor: detects stuck phases and runaway executions.
//!
//! Every tick inspects running and pending executions. An execution past
//! the maximum runtime is settled outright. Otherwise each running phase
//! whose heartbeat is older than its timeout gets exactly one recovery
//! action per tick, chosen by the configured [`TimeoutPolicy`]. Acting on
//! a phase refreshes its heartbeat, so the next action waits a full
//! timeout again.
//!
//! Every `alert_every_ticks` ticks a separate pass raises long-running
//! alerts and cleans up resolved ones.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::pipeline::Orchestrator;
use crate::collaborators::deps;
use crate::config::{span_hours, HealthConfig};
use crate::models::alert::HealthAlert;
use crate::models::execution::{counters, Execution, ExecutionStatus};
use crate::models::phase::{PhaseName, PhaseState, PhaseStatus};
use crate::resilience::CircuitBreakers;
use crate::Result;

/// Subsystem name of the work-discovery monitor.
pub const CONTENT_MONITOR: &str = "content_monitor";
/// Prefix of circuit-breaker subsystem names.
pub const CIRCUIT_BREAKER_PREFIX: &str = "circuit_breaker:";

/// What to do about a phase whose heartbeat timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Reset the phase to pending and drive it again.
    RestartPhase,
    /// Restart a named subsystem and leave the phase running.
    RestartSubsystem(String),
    /// Accept whatever the phase produced so far.
    CompletePhase(String),
    /// Give up on the phase.
    FailPhase,
}

impl Display for RecoveryAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RestartPhase => write!(f, "restart_phase"),
            Self::RestartSubsystem(name) => write!(f, "restart_subsystem:{name}"),
            Self::CompletePhase(reason) => write!(f, "complete_phase:{reason}"),
            Self::FailPhase => write!(f, "fail_phase"),
        }
    }
}

/// A running phase whose heartbeat is older than its timeout.
#[derive(Debug, Clone, Copy)]
pub struct StalePhase<'a> {
    /// Owning execution.
    pub execution: &'a Execution,
    /// Stale phase row.
    pub phase: &'a PhaseStatus,
    /// Time since the last heartbeat.
    pub age: chrono::Duration,
    /// Timeout that was exceeded.
    pub timeout: chrono::Duration,
}

impl StalePhase<'_> {
    /// Progress the phase has recorded, via its counter.
    #[must_use]
    pub fn progress(&self) -> i64 {
        progress_counter(self.phase.phase).map_or(0, |name| self.execution.counter(name))
    }
}

/// Decides the recovery action for a stale phase.
pub trait TimeoutPolicy: Send + Sync {
    /// Choose exactly one action.
    fn decide(&self, stale: &StalePhase<'_>) -> RecoveryAction;
}

/// Built-in policy.
///
/// Analysis restarts the work-discovery monitor. Enrichment accepts
/// partial progress, or else resets the provider's circuit breaker.
/// Collection and scraping accept partial progress, or else restart.
/// The remaining phases accept partial progress, or else fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTimeoutPolicy;

impl TimeoutPolicy for DefaultTimeoutPolicy {
    fn decide(&self, stale: &StalePhase<'_>) -> RecoveryAction {
        let phase = stale.phase.phase;
        if phase == PhaseName::ContentAnalysis {
            return RecoveryAction::RestartSubsystem(CONTENT_MONITOR.to_owned());
        }
        let progress = stale.progress();
        if progress > 0 {
            return RecoveryAction::CompletePhase(format!(
                "timed out after {} minutes with {progress} items done",
                stale.age.num_minutes()
            ));
        }
        match phase {
            PhaseName::CompanyEnrichment => {
                RecoveryAction::RestartSubsystem(format!("{CIRCUIT_BREAKER_PREFIX}{}", deps::COMPANY))
            }
            PhaseName::VideoEnrichment => {
                RecoveryAction::RestartSubsystem(format!("{CIRCUIT_BREAKER_PREFIX}{}", deps::VIDEO))
            }
            PhaseName::ResultCollection | PhaseName::ContentScraping => RecoveryAction::RestartPhase,
            _ => RecoveryAction::FailPhase,
        }
    }
}

fn progress_counter(phase: PhaseName) -> Option<&'static str> {
    match phase {
        PhaseName::Metrics => Some(counters::KEYWORDS_MEASURED),
        PhaseName::ResultCollection => Some(counters::RESULTS_COLLECTED),
        PhaseName::CompanyEnrichment => Some(counters::DOMAINS_ENRICHED),
        PhaseName::VideoEnrichment => Some(counters::VIDEOS_ENRICHED),
        PhaseName::ContentScraping => Some(counters::CONTENT_SCRAPED),
        PhaseName::ContentAnalysis => Some(counters::CONTENT_ANALYZED),
        PhaseName::Scoring => Some(counters::SCORES_COMPUTED),
        PhaseName::Snapshot => None,
    }
}

/// One recovery decision taken during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedAction {
    /// Execution acted on.
    pub execution_id: String,
    /// Phase acted on.
    pub phase: PhaseName,
    /// Action returned by the policy.
    pub action: RecoveryAction,
    /// Whether applying it succeeded.
    pub applied: bool,
}

/// Everything one timeout-repair pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Executions settled for exceeding the maximum runtime.
    pub settled: Vec<(String, ExecutionStatus)>,
    /// Phase recovery actions.
    pub actions: Vec<AppliedAction>,
}

/// Totals of one alert pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertReport {
    /// Alerts raised.
    pub raised: usize,
    /// Alerts resolved because their execution settled.
    pub resolved: u64,
    /// Old resolved alerts deleted.
    pub deleted: u64,
}

/// Background watchdog over all executions.
pub struct HealthMonitor {
    orchestrator: Arc<Orchestrator>,
    breakers: Arc<CircuitBreakers>,
    policy: Arc<dyn TimeoutPolicy>,
    config: HealthConfig,
    ticks: AtomicU64,
}

impl HealthMonitor {
    /// Create the monitor with the built-in policy.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        breakers: Arc<CircuitBreakers>,
        config: HealthConfig,
    ) -> Self {
        Self::with_policy(orchestrator, breakers, config, Arc::new(DefaultTimeoutPolicy))
    }

    /// Create the monitor with a custom policy.
    #[must_use]
    pub fn with_policy(
        orchestrator: Arc<Orchestrator>,
        breakers: Arc<CircuitBreakers>,
        config: HealthConfig,
        policy: Arc<dyn TimeoutPolicy>,
    ) -> Self {
        Self {
            orchestrator,
            breakers,
            policy,
            config,
            ticks: AtomicU64::new(0),
        }
    }

    /// Spawn the periodic loop.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_seconds.max(1));
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("health monitor shutting down");
                            break;
                        }
                        _ = interval.tick() => self.tick(Utc::now()).await,
                    }
                }
            }
            .instrument(info_span!("health_monitor")),
        )
    }

    /// One loop iteration: the repair pass, and the alert pass every
    /// `alert_every_ticks` ticks.
    pub async fn tick(&self, now: DateTime<Utc>) {
        match self.check_once(now).await {
            Ok(report) if !report.actions.is_empty() || !report.settled.is_empty() => {
                info!(
                    actions = report.actions.len(),
                    settled = report.settled.len(),
                    "health check applied recoveries"
                );
            }
            Ok(_) => debug!("health check clean"),
            Err(err) => error!(%err, "health check failed"),
        }

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if tick % self.config.alert_every_ticks.max(1) == 0 {
            if let Err(err) = self.alert_pass(now).await {
                error!(%err, "alert pass failed");
            }
        }
    }

    /// Timeout-repair pass.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the executions cannot be listed. Failures
    /// on individual executions are logged and skipped.
    pub async fn check_once(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let store = self.orchestrator.store();
        let executions = store
            .executions
            .list_by_status(&[ExecutionStatus::Running, ExecutionStatus::Pending])
            .await?;
        let max_runtime = span_hours(self.config.max_runtime_hours);

        let mut report = HealthReport::default();
        for execution in executions {
            if execution.elapsed(now) > max_runtime {
                match self.settle_overdue(&execution).await {
                    Ok(status) => report.settled.push((execution.id.clone(), status)),
                    Err(err) => warn!(execution_id = %execution.id, %err, "could not settle overdue execution"),
                }
                continue;
            }

            let phases = match store.phases.list_for_execution(&execution.id).await {
                Ok(phases) => phases,
                Err(err) => {
                    warn!(execution_id = %execution.id, %err, "could not load phases");
                    continue;
                }
            };
            for phase in phases.iter().filter(|p| p.status == PhaseState::Running) {
                let timeout = self.config.phase_timeout(phase.phase);
                let age = phase.heartbeat_age(now);
                if age <= timeout {
                    continue;
                }
                let stale = StalePhase {
                    execution: &execution,
                    phase,
                    age,
                    timeout,
                };
                let action = self.policy.decide(&stale);
                info!(
                    execution_id = %execution.id,
                    phase = %phase.phase,
                    age_minutes = age.num_minutes(),
                    timeout_minutes = timeout.num_minutes(),
                    %action,
                    "phase timed out"
                );
                let applied = match self.apply(&execution.id, phase.phase, &action).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(execution_id = %execution.id, phase = %phase.phase, %err, "recovery failed");
                        false
                    }
                };
                if let Err(err) = store.phases.heartbeat(&execution.id, phase.phase, now).await {
                    warn!(execution_id = %execution.id, %err, "could not refresh heartbeat");
                }
                report.actions.push(AppliedAction {
                    execution_id: execution.id.clone(),
                    phase: phase.phase,
                    action,
                    applied,
                });
            }
        }
        Ok(report)
    }

    async fn settle_overdue(&self, execution: &Execution) -> Result<ExecutionStatus> {
        let viable = self
            .orchestrator
            .store()
            .content
            .has_viable_data(&execution.id)
            .await?;
        let status = if viable {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        warn!(execution_id = %execution.id, viable, "exceeded maximum runtime");
        self.orchestrator
            .settle(&execution.id, status, "exceeded maximum runtime")
            .await?;
        Ok(status)
    }

    async fn apply(&self, execution_id: &str, phase: PhaseName, action: &RecoveryAction) -> Result<()> {
        match action {
            RecoveryAction::RestartPhase => {
                self.orchestrator
                    .restart_phase(execution_id, phase, false)
                    .await?;
            }
            RecoveryAction::RestartSubsystem(name) => {
                if name == CONTENT_MONITOR {
                    if !self.orchestrator.restart_monitor(execution_id).await? {
                        debug!(execution_id, "no monitor attached to restart");
                    }
                } else if let Some(dependency) = name.strip_prefix(CIRCUIT_BREAKER_PREFIX) {
                    self.breakers.reset(dependency);
                    info!(execution_id, dependency, "circuit breaker reset");
                } else {
                    warn!(execution_id, subsystem = %name, "unknown subsystem");
                }
            }
            RecoveryAction::CompletePhase(reason) => {
                self.orchestrator
                    .force_complete_phase(execution_id, phase, reason)
                    .await?;
            }
            RecoveryAction::FailPhase => {
                self.orchestrator
                    .force_fail_phase(execution_id, phase, "phase heartbeat timed out")
                    .await?;
            }
        }
        Ok(())
    }

    /// Long-running alert check plus alert cleanup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn alert_pass(&self, now: DateTime<Utc>) -> Result<AlertReport> {
        let store = self.orchestrator.store();
        let threshold = span_hours(self.config.long_running_alert_hours);

        let mut report = AlertReport::default();
        for execution in store
            .executions
            .list_by_status(&[ExecutionStatus::Running])
            .await?
        {
            let elapsed = execution.elapsed(now);
            if elapsed <= threshold || store.alerts.exists_for(&execution.id).await? {
                continue;
            }
            let minutes = elapsed.num_minutes();
            let alert = HealthAlert::new(
                execution.id.clone(),
                format!("execution running for {} hours", minutes / 60),
                minutes,
            );
            store.alerts.create(&alert).await?;
            warn!(execution_id = %execution.id, runtime_minutes = minutes, "long-running execution");
            report.raised += 1;
        }

        report.resolved = store.alerts.resolve_settled(now).await?;
        let retention = span_hours(self.config.alert_retention_hours);
        report.deleted = store.alerts.delete_resolved_before(now - retention).await?;
        Ok(report)
    }
}
