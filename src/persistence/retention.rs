//! Retention service for time-based data purge.
//!
//! Runs as a background task deleting children first (counters, phase
//! rows, pipeline data, alerts, schedule audit rows), then settled
//! executions last updated more than `retention_days` ago.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::db::Database;
use super::fmt_ts;
use crate::config::span_days;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

const CHILD_TABLES: [&str; 10] = [
    "execution_counter",
    "phase_status",
    "keyword_metrics",
    "search_result",
    "enrichment",
    "content",
    "content_analysis",
    "score",
    "health_alert",
    "schedule_execution",
];

/// Spawn the retention purge background task.
///
/// The task runs hourly. On each tick it deletes every record belonging to
/// executions that settled more than `retention_days` ago.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let cutoff = Utc::now() - span_days(u64::from(retention_days));
                    match purge_settled_before(&db, cutoff).await {
                        Ok(purged) => info!(retention_days, purged, "retention purge completed"),
                        Err(err) => error!(%err, "retention purge failed"),
                    }
                }
            }
        }
    })
}

/// Delete settled executions last updated before `cutoff`, with all their
/// records. Returns the number of executions removed.
///
/// # Errors
///
/// Returns `AppError::Db` if any delete fails; the transaction is rolled back.
pub async fn purge_settled_before(db: &Database, cutoff: DateTime<Utc>) -> Result<u64> {
    let cutoff = fmt_ts(cutoff);
    let selector = "SELECT id FROM execution \
                    WHERE status IN ('completed','failed','cancelled','partial') \
                      AND updated_at < ?1";
    let mut tx = db.begin().await?;

    for table in CHILD_TABLES {
        // `table` comes from the constant list above.
        let query = format!("DELETE FROM {table} WHERE execution_id IN ({selector})");
        sqlx::query(&query).bind(&cutoff).execute(&mut *tx).await?;
    }
    let result = sqlx::query(&format!("DELETE FROM execution WHERE id IN ({selector})"))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected())
}

/// Delete one execution and all of its records regardless of status.
///
/// Returns `false` if the execution did not exist.
///
/// # Errors
///
/// Returns `AppError::Db` if any delete fails; the transaction is rolled back.
pub async fn purge_execution(db: &Database, execution_id: &str) -> Result<bool> {
    let mut tx = db.begin().await?;
    for table in CHILD_TABLES {
        let query = format!("DELETE FROM {table} WHERE execution_id = ?1");
        sqlx::query(&query).bind(execution_id).execute(&mut *tx).await?;
    }
    let result = sqlx::query("DELETE FROM execution WHERE id = ?1")
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}
