//! Phase status repository for `SQLite` persistence.
//!
//! Every state change is a single conditional `UPDATE`, so two writers
//! racing on the same (execution, phase) pair can never both win.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::phase::{PhaseName, PhaseState, PhaseStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{fmt_ts, in_list, parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for phase status records.
#[derive(Clone)]
pub struct PhaseRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct PhaseRow {
    execution_id: String,
    phase: String,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    error_message: Option<String>,
    result_data: Option<String>,
}

impl PhaseRow {
    fn into_phase(self) -> Result<PhaseStatus> {
        let phase = self
            .phase
            .parse()
            .map_err(|_| AppError::Db(format!("invalid phase name: {}", self.phase)))?;
        let result_data = self
            .result_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid result_data: {e}")))?;

        Ok(PhaseStatus {
            execution_id: self.execution_id,
            phase,
            status: self.status.parse()?,
            started_at: parse_opt_ts("started_at", self.started_at.as_deref())?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            error_message: self.error_message,
            result_data,
        })
    }
}

/// Extra fields written together with a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetail {
    /// Failure reason to store.
    pub error_message: Option<String>,
    /// Executor output to store.
    pub result_data: Option<serde_json::Value>,
}

impl TransitionDetail {
    /// Detail carrying only a failure reason.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            result_data: None,
        }
    }

    /// Detail carrying only executor output.
    #[must_use]
    pub fn result(data: serde_json::Value) -> Self {
        Self {
            error_message: None,
            result_data: Some(data),
        }
    }
}

impl PhaseRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create one pending row per phase.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyInitialized` if rows already exist for the
    /// execution, or `AppError::Db` if the insert fails.
    pub async fn initialize(&self, execution_id: &str, phases: &[PhaseName]) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let mut tx = self.db.begin().await?;

        let (existing,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM phase_status WHERE execution_id = ?1")
                .bind(execution_id)
                .fetch_one(&mut *tx)
                .await?;
        if existing > 0 {
            return Err(AppError::AlreadyInitialized(format!(
                "phases for execution {execution_id} already exist"
            )));
        }

        for phase in phases {
            sqlx::query(
                "INSERT INTO phase_status (execution_id, phase, status, updated_at)
                 VALUES (?1, ?2, 'pending', ?3)",
            )
            .bind(execution_id)
            .bind(phase.as_str())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Retrieve one phase row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the row does not exist.
    pub async fn get(&self, execution_id: &str, phase: PhaseName) -> Result<PhaseStatus> {
        let row: Option<PhaseRow> = sqlx::query_as(
            "SELECT * FROM phase_status WHERE execution_id = ?1 AND phase = ?2",
        )
        .bind(execution_id)
        .bind(phase.as_str())
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(PhaseRow::into_phase)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("phase {phase} of {execution_id}")))
    }

    /// All phase rows for an execution, in execution order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<PhaseStatus>> {
        let rows: Vec<PhaseRow> =
            sqlx::query_as("SELECT * FROM phase_status WHERE execution_id = ?1")
                .bind(execution_id)
                .fetch_all(self.db.as_ref())
                .await?;

        let mut phases = rows
            .into_iter()
            .map(PhaseRow::into_phase)
            .collect::<Result<Vec<_>>>()?;
        phases.sort_by_key(|p| p.phase);
        Ok(phases)
    }

    /// Atomic compare-and-set along pending→running→{completed|failed|blocked}.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if any `from` state cannot move
    /// to `to`, or the stored state is not in `from`; `AppError::NotFound`
    /// if the row does not exist.
    pub async fn transition(
        &self,
        execution_id: &str,
        phase: PhaseName,
        from: &[PhaseState],
        to: PhaseState,
        heartbeat: DateTime<Utc>,
    ) -> Result<PhaseStatus> {
        self.transition_with(
            execution_id,
            phase,
            from,
            to,
            heartbeat,
            TransitionDetail::default(),
        )
        .await
    }

    /// [`transition`](Self::transition) that also stores error or result data.
    ///
    /// # Errors
    ///
    /// Same as [`transition`](Self::transition).
    pub async fn transition_with(
        &self,
        execution_id: &str,
        phase: PhaseName,
        from: &[PhaseState],
        to: PhaseState,
        heartbeat: DateTime<Utc>,
        detail: TransitionDetail,
    ) -> Result<PhaseStatus> {
        if from.is_empty() || from.iter().any(|state| !state.can_transition_to(to)) {
            return Err(AppError::InvalidTransition(format!(
                "{phase}: {from:?} -> {} is not a permitted transition",
                to.as_str()
            )));
        }

        let names: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();
        let result_data = detail
            .result_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let query = format!(
            "UPDATE phase_status SET status = ?1, updated_at = ?2,
                 started_at = CASE WHEN ?1 = 'running' THEN ?2 ELSE started_at END,
                 completed_at = CASE WHEN ?1 = 'running' THEN NULL ELSE ?2 END,
                 error_message = CASE WHEN ?1 = 'running' THEN NULL
                                      ELSE COALESCE(?3, error_message) END,
                 result_data = COALESCE(?4, result_data)
             WHERE execution_id = ?5 AND phase = ?6 AND status IN {}",
            in_list(&names)
        );
        let result = sqlx::query(&query)
            .bind(to.as_str())
            .bind(fmt_ts(heartbeat))
            .bind(&detail.error_message)
            .bind(&result_data)
            .bind(execution_id)
            .bind(phase.as_str())
            .execute(self.db.as_ref())
            .await?;

        let current = self.get(execution_id, phase).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::InvalidTransition(format!(
                "{phase} of {execution_id} is {}, expected one of {names:?}",
                current.status.as_str()
            )));
        }
        Ok(current)
    }

    /// Explicitly reset a phase to pending from any state.
    ///
    /// Clears timestamps and error; `result_data` is replaced by `marker`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the row does not exist.
    pub async fn reset(
        &self,
        execution_id: &str,
        phase: PhaseName,
        marker: Option<serde_json::Value>,
    ) -> Result<PhaseStatus> {
        let marker = marker.as_ref().map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            "UPDATE phase_status SET status = 'pending', started_at = NULL,
                 completed_at = NULL, error_message = NULL, result_data = ?1, updated_at = ?2
             WHERE execution_id = ?3 AND phase = ?4",
        )
        .bind(&marker)
        .bind(fmt_ts(Utc::now()))
        .bind(execution_id)
        .bind(phase.as_str())
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("phase {phase} of {execution_id}")));
        }
        self.get(execution_id, phase).await
    }

    /// Refresh the heartbeat of a running phase.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn heartbeat(
        &self,
        execution_id: &str,
        phase: PhaseName,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE phase_status SET updated_at = ?1
             WHERE execution_id = ?2 AND phase = ?3 AND status = 'running'",
        )
        .bind(fmt_ts(at))
        .bind(execution_id)
        .bind(phase.as_str())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Phases in `status` whose heartbeat predates `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_stale(
        &self,
        status: PhaseState,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PhaseStatus>> {
        let rows: Vec<PhaseRow> = sqlx::query_as(
            "SELECT * FROM phase_status WHERE status = ?1 AND updated_at < ?2 ORDER BY updated_at",
        )
        .bind(status.as_str())
        .bind(fmt_ts(cutoff))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(PhaseRow::into_phase).collect()
    }

    /// Administrative override: fail every phase still in `states`.
    ///
    /// Bypasses the transition rules; used only for operator cleanup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn force_status(
        &self,
        execution_id: &str,
        states: &[PhaseState],
        to: PhaseState,
        reason: &str,
    ) -> Result<u64> {
        let names: Vec<&'static str> = states.iter().map(|s| s.as_str()).collect();
        let now = fmt_ts(Utc::now());
        let result = sqlx::query(&format!(
            "UPDATE phase_status SET status = ?1, error_message = ?2, completed_at = ?3,
                 updated_at = ?3
             WHERE execution_id = ?4 AND status IN {}",
            in_list(&names)
        ))
        .bind(to.as_str())
        .bind(reason)
        .bind(&now)
        .bind(execution_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
