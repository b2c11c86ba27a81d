//! Recurrence scheduler.
//!
//! Each tick launches one execution per due, active schedule that is
//! under its concurrency cap. The launch covers exactly the content
//! sub-types that are due, and those sub-types advance to their next
//! occurrence immediately so later ticks do not launch them again. A
//! waiter task then awaits the execution up to the longest sub-type
//! timeout, cancelling it on expiry, and records the outcome on the
//! launch's audit row.

pub mod recurrence;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::models::execution::{ExecutionMode, ExecutionStatus};
use crate::models::pipeline::ContentType;
use crate::models::schedule::{
    NewSchedule, ScheduleConfig, ScheduleRun, ScheduleRunStatus, ScheduleUpdate,
};
use crate::orchestrator::Orchestrator;
use crate::Result;

/// One launch made by a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    /// Launching schedule.
    pub schedule_id: String,
    /// Started execution.
    pub execution_id: String,
    /// Audit row id.
    pub run_id: String,
    /// Sub-types covered.
    pub content_types: Vec<ContentType>,
    /// Deadline handed to the waiter.
    pub timeout: Duration,
}

/// Launches executions from schedules and tracks their outcomes.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    config: SchedulerConfig,
    waiters: TaskTracker,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create the scheduler.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
            waiters: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Validate and persist a new schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for invalid input.
    pub async fn create_schedule(&self, command: NewSchedule) -> Result<ScheduleConfig> {
        let schedule = command.into_schedule(Utc::now())?;
        self.orchestrator.store().schedules.create(&schedule).await?;
        info!(schedule_id = %schedule.id, name = %schedule.name, "schedule created");
        Ok(schedule)
    }

    /// Apply a validated update to a schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown schedule or
    /// `AppError::Config` for invalid input; nothing is saved on error.
    pub async fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> Result<ScheduleConfig> {
        let schedules = &self.orchestrator.store().schedules;
        let mut schedule = schedules.get(id).await?;
        update.apply(&mut schedule, Utc::now())?;
        schedules.save(&schedule).await?;
        info!(schedule_id = id, "schedule updated");
        Ok(schedule)
    }

    /// Delete a schedule, keeping its audit rows.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown schedule.
    pub async fn delete_schedule(&self, id: &str) -> Result<()> {
        self.orchestrator.store().schedules.delete(id).await?;
        info!(schedule_id = id, "schedule deleted");
        Ok(())
    }

    /// Launch every due schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the due schedules cannot be listed. A
    /// failure on one schedule is logged and does not stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Launch>> {
        let due = self
            .orchestrator
            .store()
            .schedules
            .list_active_due(now)
            .await?;

        let mut launches = Vec::new();
        for mut schedule in due {
            match self.launch(&mut schedule, now).await {
                Ok(Some(launch)) => launches.push(launch),
                Ok(None) => {}
                Err(err) => warn!(schedule_id = %schedule.id, %err, "scheduled launch failed"),
            }
        }
        Ok(launches)
    }

    async fn launch(&self, schedule: &mut ScheduleConfig, now: DateTime<Utc>) -> Result<Option<Launch>> {
        let store = self.orchestrator.store();
        let active = store.schedules.count_active_executions(&schedule.id).await?;
        if active >= i64::from(schedule.max_concurrent_executions) {
            debug!(schedule_id = %schedule.id, active, "schedule at concurrency cap");
            return Ok(None);
        }

        let content_types = schedule.due_content_types(now);
        if content_types.is_empty() {
            schedule.refresh_next_execution();
            store.schedules.save(schedule).await?;
            return Ok(None);
        }

        let execution_id = self
            .orchestrator
            .start(schedule.launch_config(&content_types), ExecutionMode::Scheduled)
            .await?;
        let run = ScheduleRun::started(&schedule.id, &execution_id, content_types.clone());
        store.schedules.insert_run(&run).await?;

        for rule in &mut schedule.content_schedules {
            if content_types.contains(&rule.content_type) {
                rule.next_run_at = Some(recurrence::next_after(&rule.recurrence, now)?);
            }
        }
        schedule.refresh_next_execution();
        schedule.last_executed_at = Some(now);
        schedule.updated_at = now;
        store.schedules.save(schedule).await?;

        let timeout = hours(schedule.timeout_hours_for(&content_types));
        info!(
            schedule_id = %schedule.id,
            execution_id = %execution_id,
            content_types = ?content_types,
            timeout_secs = timeout.as_secs(),
            "scheduled execution launched"
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        let cancel = self.cancel.child_token();
        let run_id = run.id.clone();
        let waited = execution_id.clone();
        self.waiters.spawn(
            async move { await_outcome(&orchestrator, &run_id, &waited, timeout, &cancel).await }
                .instrument(info_span!("schedule_waiter", execution_id = %execution_id)),
        );

        Ok(Some(Launch {
            schedule_id: schedule.id.clone(),
            execution_id,
            run_id: run.id,
            content_types,
            timeout,
        }))
    }

    /// Spawn the periodic loop. On shutdown, outstanding waiters are
    /// stopped and awaited; their executions keep running.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_seconds.max(1));
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("scheduler shutting down");
                            break;
                        }
                        _ = interval.tick() => match self.tick(Utc::now()).await {
                            Ok(launches) if !launches.is_empty() => {
                                info!(launched = launches.len(), "scheduler tick");
                            }
                            Ok(_) => {}
                            Err(err) => error!(%err, "scheduler tick failed"),
                        },
                    }
                }
                self.cancel.cancel();
                self.waiters.close();
                self.waiters.wait().await;
            }
            .instrument(info_span!("scheduler")),
        )
    }

    /// Wait for every outstanding waiter task to finish.
    pub async fn drain_waiters(&self) {
        self.waiters.close();
        self.waiters.wait().await;
        self.waiters.reopen();
    }
}

fn hours(value: f64) -> Duration {
    Duration::try_from_secs_f64(value * 3600.0).unwrap_or(Duration::MAX)
}

async fn await_outcome(
    orchestrator: &Orchestrator,
    run_id: &str,
    execution_id: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) {
    let waited = tokio::select! {
        () = cancel.cancelled() => return,
        waited = orchestrator.wait_for_completion(execution_id, timeout) => waited,
    };

    let status = match waited {
        Ok(Some(execution)) => run_status(execution.status),
        Ok(None) => {
            warn!(timeout_secs = timeout.as_secs(), "scheduled execution timed out");
            if let Err(err) = orchestrator.cancel(execution_id).await {
                warn!(%err, "could not cancel timed-out execution");
            }
            ScheduleRunStatus::TimedOut
        }
        Err(err) => {
            error!(%err, "lost track of scheduled execution");
            ScheduleRunStatus::Failed
        }
    };

    match orchestrator.store().schedules.finish_run(run_id, status).await {
        Ok(true) => info!(status = status.as_str(), "scheduled execution finished"),
        Ok(false) => debug!("launch outcome already recorded"),
        Err(err) => error!(%err, "could not record launch outcome"),
    }
}

fn run_status(status: ExecutionStatus) -> ScheduleRunStatus {
    match status {
        ExecutionStatus::Completed => ScheduleRunStatus::Completed,
        ExecutionStatus::Partial => ScheduleRunStatus::Partial,
        ExecutionStatus::Cancelled => ScheduleRunStatus::Cancelled,
        ExecutionStatus::Failed | ExecutionStatus::Pending | ExecutionStatus::Running => {
            ScheduleRunStatus::Failed
        }
    }
}
