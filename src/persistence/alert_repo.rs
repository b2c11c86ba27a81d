//! Health alert repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::alert::{AlertStatus, HealthAlert};
use crate::{AppError, Result};

use super::db::Database;
use super::{fmt_ts, parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for health alerts.
#[derive(Clone)]
pub struct AlertRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: String,
    execution_id: String,
    message: String,
    runtime_minutes: i64,
    status: String,
    created_at: String,
    resolved_at: Option<String>,
}

impl AlertRow {
    fn into_alert(self) -> Result<HealthAlert> {
        let status = match self.status.as_str() {
            "active" => AlertStatus::Active,
            "resolved" => AlertStatus::Resolved,
            other => return Err(AppError::Db(format!("invalid alert status: {other}"))),
        };
        Ok(HealthAlert {
            id: self.id,
            execution_id: self.execution_id,
            message: self.message,
            runtime_minutes: self.runtime_minutes,
            status,
            created_at: parse_ts("created_at", &self.created_at)?,
            resolved_at: parse_opt_ts("resolved_at", self.resolved_at.as_deref())?,
        })
    }
}

impl AlertRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert an alert.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, alert: &HealthAlert) -> Result<()> {
        sqlx::query(
            "INSERT INTO health_alert
             (id, execution_id, message, runtime_minutes, status, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&alert.id)
        .bind(&alert.execution_id)
        .bind(&alert.message)
        .bind(alert.runtime_minutes)
        .bind(alert.status.as_str())
        .bind(fmt_ts(alert.created_at))
        .bind(alert.resolved_at.map(fmt_ts))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Whether the execution already has an alert in any status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn exists_for(&self, execution_id: &str) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM health_alert WHERE execution_id = ?1")
                .bind(execution_id)
                .fetch_one(self.db.as_ref())
                .await?;
        Ok(count > 0)
    }

    /// Active alerts, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_active(&self) -> Result<Vec<HealthAlert>> {
        let rows: Vec<AlertRow> = sqlx::query_as(
            "SELECT * FROM health_alert WHERE status = 'active' ORDER BY created_at",
        )
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(AlertRow::into_alert).collect()
    }

    /// Resolve active alerts whose execution has settled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn resolve_settled(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE health_alert SET status = 'resolved', resolved_at = ?1
              WHERE status = 'active'
                AND execution_id IN (SELECT id FROM execution
                                      WHERE status NOT IN ('pending','running'))",
        )
        .bind(fmt_ts(now))
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete resolved alerts resolved before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM health_alert WHERE status = 'resolved' AND resolved_at < ?1",
        )
        .bind(fmt_ts(cutoff))
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
