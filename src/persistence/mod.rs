//! Persistence layer modules.
//!
//! The [`StateStore`] bundles every repository over one shared pool and is
//! the only durable resource the orchestrator shares between tasks.

pub mod alert_repo;
pub mod content_repo;
pub mod db;
pub mod execution_repo;
pub mod phase_repo;
pub mod retention;
pub mod schedule_repo;
pub mod schema;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

use self::alert_repo::AlertRepo;
use self::content_repo::ContentRepo;
use self::db::Database;
use self::execution_repo::ExecutionRepo;
use self::phase_repo::PhaseRepo;
use self::schedule_repo::ScheduleRepo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Format a timestamp as fixed-width UTC text.
///
/// Every persisted timestamp uses this format so SQL string comparison
/// orders the same way as time.
#[must_use]
pub fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a persisted timestamp column.
///
/// # Errors
///
/// Returns `AppError::Db` naming `field` if the text is not RFC 3339.
pub fn parse_ts(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

/// Parse an optional persisted timestamp column.
///
/// # Errors
///
/// Returns `AppError::Db` naming `field` if present but malformed.
pub fn parse_opt_ts(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(field, s)).transpose()
}

/// `IN (...)` list of quoted status literals.
///
/// Only ever fed compile-time `as_str()` values, never user input.
pub(crate) fn in_list(values: &[&'static str]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| format!("'{v}'")).collect();
    format!("({})", quoted.join(","))
}

/// Every repository over one shared connection pool.
#[derive(Clone)]
pub struct StateStore {
    /// Execution rows and counters.
    pub executions: ExecutionRepo,
    /// Phase status rows.
    pub phases: PhaseRepo,
    /// Pipeline data produced by phase executors.
    pub content: ContentRepo,
    /// Schedules and their audit trail.
    pub schedules: ScheduleRepo,
    /// Health alerts.
    pub alerts: AlertRepo,
    db: Arc<Database>,
}

impl StateStore {
    /// Build every repository over `db`.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            executions: ExecutionRepo::new(Arc::clone(&db)),
            phases: PhaseRepo::new(Arc::clone(&db)),
            content: ContentRepo::new(Arc::clone(&db)),
            schedules: ScheduleRepo::new(Arc::clone(&db)),
            alerts: AlertRepo::new(Arc::clone(&db)),
            db,
        }
    }

    /// Shared pool.
    #[must_use]
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }
}
