//! Recurring schedule configuration and its audit trail.

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline::{ContentType, PipelineConfig};
use crate::{AppError, Result};

/// When a content sub-type recurs. Times are UTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// Every day at `hour:minute`.
    Daily {
        /// Hour of day, 0-23.
        hour: u32,
        /// Minute, 0-59.
        minute: u32,
    },
    /// Every week on `weekday` at `hour:minute`.
    Weekly {
        /// Day of week.
        weekday: Weekday,
        /// Hour of day, 0-23.
        hour: u32,
        /// Minute, 0-59.
        minute: u32,
    },
    /// Every month on `day` at `hour:minute`; months without `day` are skipped.
    Monthly {
        /// Day of month, 1-31.
        day: u32,
        /// Hour of day, 0-23.
        hour: u32,
        /// Minute, 0-59.
        minute: u32,
    },
    /// January, April, July and October on `day` at `hour:minute`.
    Quarterly {
        /// Day of month, 1-31.
        day: u32,
        /// Hour of day, 0-23.
        hour: u32,
        /// Minute, 0-59.
        minute: u32,
    },
    /// Standard five-field cron expression.
    Cron {
        /// `minute hour day-of-month month day-of-week`.
        expression: String,
    },
}

/// Recurrence and limits for one content sub-type of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ContentSchedule {
    /// Sub-type this rule launches.
    pub content_type: ContentType,
    /// Recurrence rule.
    pub recurrence: Recurrence,
    /// Longest a launched execution may run before it is cancelled.
    pub timeout_hours: f64,
    /// Next due time for this sub-type.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

/// A recurring pipeline launch definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ScheduleConfig {
    /// Unique record identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Inactive schedules are never launched.
    pub active: bool,
    /// One rule per content sub-type.
    pub content_schedules: Vec<ContentSchedule>,
    /// Keyword filter passed to launched executions.
    pub keywords: Vec<String>,
    /// Region filter passed to launched executions.
    pub regions: Vec<String>,
    /// Cap on non-terminal executions launched from this schedule.
    pub max_concurrent_executions: u32,
    /// Remaining pipeline settings for launched executions.
    pub template: PipelineConfig,
    /// Earliest `next_run_at` across sub-types.
    pub next_execution_at: Option<DateTime<Utc>>,
    /// Last launch time.
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ScheduleConfig {
    /// Recompute `next_execution_at` from the per-sub-type due times.
    pub fn refresh_next_execution(&mut self) {
        self.next_execution_at = self
            .content_schedules
            .iter()
            .filter_map(|c| c.next_run_at)
            .min();
    }

    /// Sub-types whose rule is due at `now`.
    #[must_use]
    pub fn due_content_types(&self, now: DateTime<Utc>) -> Vec<ContentType> {
        self.content_schedules
            .iter()
            .filter(|c| c.next_run_at.is_some_and(|at| at <= now))
            .map(|c| c.content_type)
            .collect()
    }

    /// Pipeline configuration for a launch covering `content_types`.
    #[must_use]
    pub fn launch_config(&self, content_types: &[ContentType]) -> PipelineConfig {
        PipelineConfig {
            keywords: self.keywords.clone(),
            regions: self.regions.clone(),
            content_types: content_types.to_vec(),
            schedule_id: Some(self.id.clone()),
            ..self.template.clone()
        }
    }

    /// Longest timeout among the given sub-types, in hours.
    #[must_use]
    pub fn timeout_hours_for(&self, content_types: &[ContentType]) -> f64 {
        self.content_schedules
            .iter()
            .filter(|c| content_types.contains(&c.content_type))
            .map(|c| c.timeout_hours)
            .fold(0.0, f64::max)
    }
}

fn validate_clock(hour: u32, minute: u32) -> Result<()> {
    if hour > 23 || minute > 59 {
        return Err(AppError::Config(format!("invalid time {hour}:{minute}")));
    }
    Ok(())
}

/// Validate a recurrence rule.
///
/// # Errors
///
/// Returns `AppError::Config` for out-of-range fields or an unparsable
/// cron expression.
pub fn validate_recurrence(recurrence: &Recurrence) -> Result<()> {
    match recurrence {
        Recurrence::Daily { hour, minute } | Recurrence::Weekly { hour, minute, .. } => {
            validate_clock(*hour, *minute)
        }
        Recurrence::Monthly { day, hour, minute } | Recurrence::Quarterly { day, hour, minute } => {
            if !(1..=31).contains(day) {
                return Err(AppError::Config(format!("invalid day of month {day}")));
            }
            validate_clock(*hour, *minute)
        }
        Recurrence::Cron { expression } => {
            crate::scheduler::recurrence::parse_cron(expression).map(|_| ())
        }
    }
}

fn validate_content_schedules(rules: &[ContentSchedule]) -> Result<()> {
    if rules.is_empty() {
        return Err(AppError::Config("schedule needs at least one content rule".into()));
    }
    for (idx, rule) in rules.iter().enumerate() {
        if rules[..idx].iter().any(|r| r.content_type == rule.content_type) {
            return Err(AppError::Config(format!(
                "duplicate rule for content type {}",
                rule.content_type.as_str()
            )));
        }
        if !(rule.timeout_hours.is_finite() && rule.timeout_hours > 0.0) {
            return Err(AppError::Config("timeout_hours must be positive".into()));
        }
        validate_recurrence(&rule.recurrence)?;
    }
    Ok(())
}

fn validate_filters(keywords: &[String], regions: &[String]) -> Result<()> {
    if keywords.iter().all(|k| k.trim().is_empty()) {
        return Err(AppError::Config("schedule keywords must not be empty".into()));
    }
    if regions.is_empty() {
        return Err(AppError::Config("schedule regions must not be empty".into()));
    }
    Ok(())
}

/// Command creating a new schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct NewSchedule {
    /// Display name.
    pub name: String,
    /// One rule per content sub-type.
    pub content_schedules: Vec<ContentSchedule>,
    /// Keyword filter.
    pub keywords: Vec<String>,
    /// Region filter.
    pub regions: Vec<String>,
    /// Concurrency cap.
    pub max_concurrent_executions: u32,
    /// Remaining pipeline settings.
    #[serde(default)]
    pub template: PipelineConfig,
}

impl NewSchedule {
    /// Validate and build the schedule, computing first due times from `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any field is invalid.
    pub fn into_schedule(self, now: DateTime<Utc>) -> Result<ScheduleConfig> {
        if self.name.trim().is_empty() {
            return Err(AppError::Config("schedule name must not be empty".into()));
        }
        if self.max_concurrent_executions == 0 {
            return Err(AppError::Config(
                "max_concurrent_executions must be greater than zero".into(),
            ));
        }
        validate_filters(&self.keywords, &self.regions)?;
        validate_content_schedules(&self.content_schedules)?;

        let mut schedule = ScheduleConfig {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            active: true,
            content_schedules: self.content_schedules,
            keywords: self.keywords,
            regions: self.regions,
            max_concurrent_executions: self.max_concurrent_executions,
            template: self.template,
            next_execution_at: None,
            last_executed_at: None,
            created_at: now,
            updated_at: now,
        };
        crate::scheduler::recurrence::seed_next_runs(&mut schedule, now)?;
        Ok(schedule)
    }
}

/// Command updating the mutable fields of a schedule.
///
/// Every present field is validated before anything is merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ScheduleUpdate {
    /// New display name.
    pub name: Option<String>,
    /// Activate or deactivate.
    pub active: Option<bool>,
    /// Replace all content rules; due times are recomputed.
    pub content_schedules: Option<Vec<ContentSchedule>>,
    /// Replace keyword filter.
    pub keywords: Option<Vec<String>>,
    /// Replace region filter.
    pub regions: Option<Vec<String>>,
    /// New concurrency cap.
    pub max_concurrent_executions: Option<u32>,
}

impl ScheduleUpdate {
    /// Validate the command against the current schedule, then merge it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any provided field is invalid; the
    /// schedule is left untouched in that case.
    pub fn apply(self, schedule: &mut ScheduleConfig, now: DateTime<Utc>) -> Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(AppError::Config("schedule name must not be empty".into()));
            }
        }
        if self.max_concurrent_executions == Some(0) {
            return Err(AppError::Config(
                "max_concurrent_executions must be greater than zero".into(),
            ));
        }
        validate_filters(
            self.keywords.as_deref().unwrap_or(&schedule.keywords),
            self.regions.as_deref().unwrap_or(&schedule.regions),
        )?;
        if let Some(rules) = &self.content_schedules {
            validate_content_schedules(rules)?;
        }

        let mut next = schedule.clone();
        if let Some(name) = self.name {
            next.name = name;
        }
        if let Some(active) = self.active {
            next.active = active;
        }
        if let Some(keywords) = self.keywords {
            next.keywords = keywords;
        }
        if let Some(regions) = self.regions {
            next.regions = regions;
        }
        if let Some(cap) = self.max_concurrent_executions {
            next.max_concurrent_executions = cap;
        }
        if let Some(rules) = self.content_schedules {
            next.content_schedules = rules;
            crate::scheduler::recurrence::seed_next_runs(&mut next, now)?;
        }
        next.updated_at = now;
        *schedule = next;
        Ok(())
    }
}

/// Outcome recorded for one scheduled launch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunStatus {
    /// Execution launched, outcome not yet known.
    Started,
    /// Execution completed.
    Completed,
    /// Execution finished with partial data.
    Partial,
    /// Execution failed.
    Failed,
    /// Execution was cancelled by someone else.
    Cancelled,
    /// Deadline passed; the scheduler cancelled the execution.
    TimedOut,
}

impl ScheduleRunStatus {
    /// Persisted name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::str::FromStr for ScheduleRunStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(AppError::Db(format!("invalid schedule run status: {other}"))),
        }
    }
}

/// Audit row for one scheduled launch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ScheduleRun {
    /// Unique record identifier.
    pub id: String,
    /// Launching schedule.
    pub schedule_id: String,
    /// Launched execution.
    pub execution_id: String,
    /// Sub-types covered by the launch.
    pub content_types: Vec<ContentType>,
    /// Outcome.
    pub status: ScheduleRunStatus,
    /// Launch time.
    pub started_at: DateTime<Utc>,
    /// Outcome time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScheduleRun {
    /// Audit row for a launch that just happened.
    #[must_use]
    pub fn started(schedule_id: &str, execution_id: &str, content_types: Vec<ContentType>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule_id.to_owned(),
            execution_id: execution_id.to_owned(),
            content_types,
            status: ScheduleRunStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}
