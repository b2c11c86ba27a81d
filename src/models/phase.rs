//! Phase identity and per-execution phase status records.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppError;

/// Ordered stages of one pipeline execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    /// Keyword search-volume and difficulty gathering.
    Metrics,
    /// Search-results collection per keyword, region and content type.
    ResultCollection,
    /// Company profile lookup per result domain.
    CompanyEnrichment,
    /// Video metadata lookup per video result.
    VideoEnrichment,
    /// Page content fetching.
    ContentScraping,
    /// Dimension analysis, driven by the work-discovery monitor.
    ContentAnalysis,
    /// Aggregate score computation.
    Scoring,
    /// Final summary of counters and persisted totals.
    Snapshot,
}

impl PhaseName {
    /// Fixed execution order.
    pub const ORDER: [Self; 8] = [
        Self::Metrics,
        Self::ResultCollection,
        Self::CompanyEnrichment,
        Self::VideoEnrichment,
        Self::ContentScraping,
        Self::ContentAnalysis,
        Self::Scoring,
        Self::Snapshot,
    ];

    /// Persisted name of the phase.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::ResultCollection => "result_collection",
            Self::CompanyEnrichment => "company_enrichment",
            Self::VideoEnrichment => "video_enrichment",
            Self::ContentScraping => "content_scraping",
            Self::ContentAnalysis => "content_analysis",
            Self::Scoring => "scoring",
            Self::Snapshot => "snapshot",
        }
    }

    /// Heartbeat timeout applied when the configuration has no override.
    #[must_use]
    pub fn default_timeout_minutes(self) -> u64 {
        match self {
            Self::Metrics | Self::Scoring | Self::Snapshot => 30,
            Self::ResultCollection => 120,
            Self::CompanyEnrichment | Self::VideoEnrichment => 60,
            Self::ContentScraping => 180,
            Self::ContentAnalysis => 240,
        }
    }

    /// Failure of a critical phase leaves nothing for later phases to do.
    #[must_use]
    pub fn is_critical(self) -> bool {
        matches!(self, Self::ResultCollection)
    }
}

impl Display for PhaseName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| AppError::Config(format!("unknown phase: {s}")))
    }
}

/// Lifecycle status of one phase within one execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    /// Not yet started, or explicitly reset.
    Pending,
    /// Executor invoked; heartbeat expected.
    Running,
    /// Executor returned successfully.
    Completed,
    /// Executor returned an error or recovery gave up.
    Failed,
    /// Interrupted by cancellation.
    Blocked,
}

impl PhaseState {
    /// Persisted name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    /// Whether `self -> next` follows pending→running→{completed|failed|blocked}.
    ///
    /// Resets to pending are a separate, explicit operation.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed | Self::Failed | Self::Blocked)
        )
    }
}

impl FromStr for PhaseState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(AppError::Db(format!("invalid phase state: {other}"))),
        }
    }
}

/// Persisted status row, unique per (execution, phase).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PhaseStatus {
    /// Owning execution.
    pub execution_id: String,
    /// Which phase this row tracks.
    pub phase: PhaseName,
    /// Current state.
    pub status: PhaseState,
    /// When the phase last entered `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the phase last left `running`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Heartbeat.
    pub updated_at: DateTime<Utc>,
    /// Last failure reason.
    pub error_message: Option<String>,
    /// Opaque executor output.
    pub result_data: Option<serde_json::Value>,
}

impl PhaseStatus {
    /// Minutes since the last heartbeat.
    #[must_use]
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }

    /// Whether the phase asked for a fresh re-analysis when it was reset.
    #[must_use]
    pub fn fresh_requested(&self) -> bool {
        self.result_data
            .as_ref()
            .and_then(|data| data.get("fresh"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Caller-facing view of one phase.
pub type PhaseSnapshot = PhaseStatus;
