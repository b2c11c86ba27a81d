//! Schedule repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::schedule::{ScheduleConfig, ScheduleRun, ScheduleRunStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{fmt_ts, parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for schedules and scheduled launches.
#[derive(Clone)]
pub struct ScheduleRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    name: String,
    active: i64,
    content_schedules: String,
    keywords: String,
    regions: String,
    max_concurrent_executions: i64,
    template: String,
    next_execution_at: Option<String>,
    last_executed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn json_column<T: serde::de::DeserializeOwned>(field: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<ScheduleConfig> {
        Ok(ScheduleConfig {
            active: self.active != 0,
            content_schedules: json_column("content_schedules", &self.content_schedules)?,
            keywords: json_column("keywords", &self.keywords)?,
            regions: json_column("regions", &self.regions)?,
            max_concurrent_executions: u32::try_from(self.max_concurrent_executions)
                .map_err(|e| AppError::Db(format!("invalid max_concurrent_executions: {e}")))?,
            template: json_column("template", &self.template)?,
            next_execution_at: parse_opt_ts("next_execution_at", self.next_execution_at.as_deref())?,
            last_executed_at: parse_opt_ts("last_executed_at", self.last_executed_at.as_deref())?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            id: self.id,
            name: self.name,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    schedule_id: String,
    execution_id: String,
    content_types: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<ScheduleRun> {
        Ok(ScheduleRun {
            content_types: json_column("content_types", &self.content_types)?,
            status: self.status.parse()?,
            started_at: parse_ts("started_at", &self.started_at)?,
            finished_at: parse_opt_ts("finished_at", self.finished_at.as_deref())?,
            id: self.id,
            schedule_id: self.schedule_id,
            execution_id: self.execution_id,
        })
    }
}

impl ScheduleRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, schedule: &ScheduleConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedule_config (id, name, active, content_schedules, keywords, regions,
             max_concurrent_executions, template, next_execution_at, last_executed_at,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&schedule.id)
        .bind(&schedule.name)
        .bind(schedule.active)
        .bind(serde_json::to_string(&schedule.content_schedules)?)
        .bind(serde_json::to_string(&schedule.keywords)?)
        .bind(serde_json::to_string(&schedule.regions)?)
        .bind(i64::from(schedule.max_concurrent_executions))
        .bind(serde_json::to_string(&schedule.template)?)
        .bind(schedule.next_execution_at.map(fmt_ts))
        .bind(schedule.last_executed_at.map(fmt_ts))
        .bind(fmt_ts(schedule.created_at))
        .bind(fmt_ts(schedule.updated_at))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Overwrite every mutable column of an existing schedule.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the schedule does not exist.
    pub async fn save(&self, schedule: &ScheduleConfig) -> Result<()> {
        let result = sqlx::query(
            "UPDATE schedule_config SET name = ?1, active = ?2, content_schedules = ?3,
                 keywords = ?4, regions = ?5, max_concurrent_executions = ?6, template = ?7,
                 next_execution_at = ?8, last_executed_at = ?9, updated_at = ?10
             WHERE id = ?11",
        )
        .bind(&schedule.name)
        .bind(schedule.active)
        .bind(serde_json::to_string(&schedule.content_schedules)?)
        .bind(serde_json::to_string(&schedule.keywords)?)
        .bind(serde_json::to_string(&schedule.regions)?)
        .bind(i64::from(schedule.max_concurrent_executions))
        .bind(serde_json::to_string(&schedule.template)?)
        .bind(schedule.next_execution_at.map(fmt_ts))
        .bind(schedule.last_executed_at.map(fmt_ts))
        .bind(fmt_ts(schedule.updated_at))
        .bind(&schedule.id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("schedule {} not found", schedule.id)));
        }
        Ok(())
    }

    /// Retrieve a schedule by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the schedule does not exist.
    pub async fn get(&self, id: &str) -> Result<ScheduleConfig> {
        let row: Option<ScheduleRow> = sqlx::query_as("SELECT * FROM schedule_config WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(ScheduleRow::into_schedule)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("schedule {id} not found")))
    }

    /// Every schedule, by name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<ScheduleConfig>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as("SELECT * FROM schedule_config ORDER BY name")
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    /// Active schedules with any sub-type due at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_active_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleConfig>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            "SELECT * FROM schedule_config
              WHERE active = 1 AND next_execution_at IS NOT NULL AND next_execution_at <= ?1
              ORDER BY next_execution_at",
        )
        .bind(fmt_ts(now))
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    /// Delete a schedule; its audit rows are kept.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the schedule does not exist.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM schedule_config WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("schedule {id} not found")));
        }
        Ok(())
    }

    /// Number of executions launched by the schedule that are still pending
    /// or running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_active_executions(&self, schedule_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT e.id) FROM schedule_execution s
               JOIN execution e ON e.id = s.execution_id
              WHERE s.schedule_id = ?1 AND e.status IN ('pending','running')",
        )
        .bind(schedule_id)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(count)
    }

    /// Insert a launch audit row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_run(&self, run: &ScheduleRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedule_execution
             (id, schedule_id, execution_id, content_types, status, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&run.id)
        .bind(&run.schedule_id)
        .bind(&run.execution_id)
        .bind(serde_json::to_string(&run.content_types)?)
        .bind(run.status.as_str())
        .bind(fmt_ts(run.started_at))
        .bind(run.finished_at.map(fmt_ts))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Record the outcome of a launch that is still `started`.
    ///
    /// Returns `false` if the row was already finished.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn finish_run(&self, run_id: &str, status: ScheduleRunStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE schedule_execution SET status = ?1, finished_at = ?2
              WHERE id = ?3 AND status = 'started'",
        )
        .bind(status.as_str())
        .bind(fmt_ts(Utc::now()))
        .bind(run_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Launch history of a schedule, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_runs(&self, schedule_id: &str) -> Result<Vec<ScheduleRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT * FROM schedule_execution WHERE schedule_id = ?1 ORDER BY started_at DESC",
        )
        .bind(schedule_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }
}
