//! Execution repository for `SQLite` persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::execution::{Execution, ExecutionIssue, ExecutionStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{fmt_ts, in_list, parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for execution records.
#[derive(Clone)]
pub struct ExecutionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    status: String,
    mode: String,
    config: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    issues: String,
}

impl ExecutionRow {
    /// Convert a database row into the domain model (counters filled later).
    fn into_execution(self) -> Result<Execution> {
        Ok(Execution {
            status: self.status.parse()?,
            mode: self.mode.parse()?,
            config: serde_json::from_str(&self.config)
                .map_err(|e| AppError::Db(format!("invalid config: {e}")))?,
            created_at: parse_ts("created_at", &self.created_at)?,
            started_at: parse_opt_ts("started_at", self.started_at.as_deref())?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            issues: serde_json::from_str(&self.issues)
                .map_err(|e| AppError::Db(format!("invalid issues: {e}")))?,
            counters: BTreeMap::new(),
            id: self.id,
        })
    }
}

const COLUMNS: &str =
    "id, status, mode, config, created_at, started_at, completed_at, updated_at, issues";

impl ExecutionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new execution record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, execution: &Execution) -> Result<Execution> {
        let config = serde_json::to_string(&execution.config)?;
        let issues = serde_json::to_string(&execution.issues)?;

        sqlx::query(
            "INSERT INTO execution (id, status, mode, config, schedule_id, created_at,
             started_at, completed_at, updated_at, issues)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&execution.id)
        .bind(execution.status.as_str())
        .bind(execution.mode.as_str())
        .bind(&config)
        .bind(&execution.config.schedule_id)
        .bind(fmt_ts(execution.created_at))
        .bind(execution.started_at.map(fmt_ts))
        .bind(execution.completed_at.map(fmt_ts))
        .bind(fmt_ts(execution.updated_at))
        .bind(&issues)
        .execute(self.db.as_ref())
        .await?;

        Ok(execution.clone())
    }

    /// Retrieve an execution by identifier, counters included.
    ///
    /// Returns `Ok(None)` if the execution does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Execution>> {
        let row: Option<ExecutionRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM execution WHERE id = ?1"))
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        match row {
            Some(row) => {
                let mut execution = row.into_execution()?;
                execution.counters = self.counters(id).await?;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    /// Retrieve an execution that must exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution does not exist.
    pub async fn require(&self, id: &str) -> Result<Execution> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))
    }

    /// Counter values for an execution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn counters(&self, id: &str) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT name, value FROM execution_counter WHERE execution_id = ?1")
                .bind(id)
                .fetch_all(self.db.as_ref())
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn hydrate(&self, rows: Vec<ExecutionRow>) -> Result<Vec<Execution>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut execution = row.into_execution()?;
            execution.counters = self.counters(&execution.id).await?;
            out.push(execution);
        }
        Ok(out)
    }

    /// Most recently created executions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM execution ORDER BY created_at DESC LIMIT ?1"
        ))
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;
        self.hydrate(rows).await
    }

    /// Executions whose status is any of `statuses`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>> {
        let names: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM execution WHERE status IN {} ORDER BY created_at",
            in_list(&names)
        ))
        .fetch_all(self.db.as_ref())
        .await?;
        self.hydrate(rows).await
    }

    /// Executions in `status` whose heartbeat predates `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_stale(
        &self,
        status: ExecutionStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM execution WHERE status = ?1 AND updated_at < ?2 \
             ORDER BY updated_at"
        ))
        .bind(status.as_str())
        .bind(fmt_ts(cutoff))
        .fetch_all(self.db.as_ref())
        .await?;
        self.hydrate(rows).await
    }

    /// `running` executions started at or after `since`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_running_since(&self, since: DateTime<Utc>) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM execution WHERE status = 'running' AND started_at >= ?1 \
             ORDER BY started_at DESC"
        ))
        .bind(fmt_ts(since))
        .fetch_all(self.db.as_ref())
        .await?;
        self.hydrate(rows).await
    }

    /// Compare-and-set the execution status.
    ///
    /// Entering `running` stamps `started_at` once and clears `completed_at`;
    /// entering a settled status stamps `completed_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution does not exist, or
    /// `AppError::InvalidTransition` if its status is not in `from`.
    pub async fn transition_status(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<Execution> {
        let now = fmt_ts(Utc::now());
        let names: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();
        let query = format!(
            "UPDATE execution SET status = ?1, updated_at = ?2,
                 started_at = CASE WHEN ?1 = 'running' THEN COALESCE(started_at, ?2) ELSE started_at END,
                 completed_at = CASE WHEN ?1 = 'running' THEN NULL
                                     WHEN ?3 THEN ?2 ELSE completed_at END
             WHERE id = ?4 AND status IN {}",
            in_list(&names)
        );
        let result = sqlx::query(&query)
            .bind(to.as_str())
            .bind(&now)
            .bind(to.is_settled())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        let current = self.require(id).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::InvalidTransition(format!(
                "execution {id} is {}, expected one of {names:?}",
                current.status.as_str()
            )));
        }
        Ok(current)
    }

    /// Atomically add `delta` to a counter and refresh the heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn increment_counter(&self, id: &str, name: &str, delta: i64) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO execution_counter (execution_id, name, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(execution_id, name) DO UPDATE SET value = value + excluded.value",
        )
        .bind(id)
        .bind(name)
        .bind(delta)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE execution SET updated_at = ?1 WHERE id = ?2")
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Set the heartbeat to `at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE execution SET updated_at = ?1 WHERE id = ?2")
            .bind(fmt_ts(at))
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Atomically append an error or warning.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn append_issue(&self, id: &str, issue: &ExecutionIssue) -> Result<()> {
        let entry = serde_json::to_string(issue)?;
        sqlx::query(
            "UPDATE execution SET issues = json_insert(issues, '$[#]', json(?1)), \
             updated_at = ?2 WHERE id = ?3",
        )
        .bind(&entry)
        .bind(fmt_ts(Utc::now()))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Replace the stored pipeline configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_config(
        &self,
        id: &str,
        config: &crate::models::pipeline::PipelineConfig,
    ) -> Result<()> {
        sqlx::query("UPDATE execution SET config = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(serde_json::to_string(config)?)
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}
