//! Execution model and lifecycle helpers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::{PhaseName, PhaseSnapshot};
use super::pipeline::PipelineConfig;
use crate::AppError;

/// Counter names incremented as phases make progress.
pub mod counters {
    /// Keywords with metrics recorded.
    pub const KEYWORDS_MEASURED: &str = "keywords_measured";
    /// Search results stored.
    pub const RESULTS_COLLECTED: &str = "results_collected";
    /// Domains looked up by company enrichment.
    pub const DOMAINS_ENRICHED: &str = "domains_enriched";
    /// Video URLs looked up by video enrichment.
    pub const VIDEOS_ENRICHED: &str = "videos_enriched";
    /// Pages fetched.
    pub const CONTENT_SCRAPED: &str = "content_scraped";
    /// Work items analyzed.
    pub const CONTENT_ANALYZED: &str = "content_analyzed";
    /// Scores computed.
    pub const SCORES_COMPUTED: &str = "scores_computed";
}

/// Lifecycle status for an execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, phases not yet driven.
    Pending,
    /// Phases are being driven.
    Running,
    /// Every enabled phase completed.
    Completed,
    /// Gave up without viable data.
    Failed,
    /// Stopped by an operator.
    Cancelled,
    /// Finished with some phases failed but useful data produced.
    Partial,
}

impl ExecutionStatus {
    /// Persisted name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Partial => "partial",
        }
    }

    /// Completed, failed and cancelled executions are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Terminal, or finished with a partial outcome.
    #[must_use]
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == Self::Partial
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "partial" => Ok(Self::Partial),
            other => Err(AppError::Db(format!("invalid execution status: {other}"))),
        }
    }
}

/// How the execution was launched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Started by an operator.
    #[default]
    Manual,
    /// Started by the scheduler.
    Scheduled,
    /// Reduced scope run.
    Testing,
    /// Continuation of earlier work.
    Resume,
}

impl ExecutionMode {
    /// Persisted name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Testing => "testing",
            Self::Resume => "resume",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "testing" => Ok(Self::Testing),
            "resume" => Ok(Self::Resume),
            other => Err(AppError::Config(format!("invalid execution mode: {other}"))),
        }
    }
}

/// Severity of a recorded issue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    /// Something failed.
    Error,
    /// Degraded but continuing.
    Warning,
}

/// One entry in an execution's accumulated error/warning list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionIssue {
    /// When the issue was recorded.
    pub at: DateTime<Utc>,
    /// Severity.
    pub level: IssueLevel,
    /// Phase the issue belongs to, if any.
    pub phase: Option<PhaseName>,
    /// Description.
    pub message: String,
}

impl ExecutionIssue {
    /// Error entry stamped now.
    #[must_use]
    pub fn error(phase: Option<PhaseName>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level: IssueLevel::Error,
            phase,
            message: message.into(),
        }
    }

    /// Warning entry stamped now.
    #[must_use]
    pub fn warning(phase: Option<PhaseName>, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            ..Self::error(phase, message)
        }
    }
}

/// One run of the full pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Execution {
    /// Unique record identifier.
    pub id: String,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Launch mode.
    pub mode: ExecutionMode,
    /// Scope and tuning.
    pub config: PipelineConfig,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When the execution first entered `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution settled.
    pub completed_at: Option<DateTime<Utc>>,
    /// Heartbeat.
    pub updated_at: DateTime<Utc>,
    /// Progress counters keyed by counter name.
    pub counters: BTreeMap<String, i64>,
    /// Accumulated errors and warnings.
    pub issues: Vec<ExecutionIssue>,
}

impl Execution {
    /// Construct a new pending execution with a generated identifier.
    #[must_use]
    pub fn new(config: PipelineConfig, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: ExecutionStatus::Pending,
            mode,
            config,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            counters: BTreeMap::new(),
            issues: Vec::new(),
        }
    }

    /// Value of a counter, zero when never incremented.
    #[must_use]
    pub fn counter(&self, name: &str) -> i64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Time since the execution started running (or was created).
    #[must_use]
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at.unwrap_or(self.created_at)
    }
}

/// Caller-facing view of an execution and its phases.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionSnapshot {
    /// Execution record.
    pub execution: Execution,
    /// Phase rows in execution order.
    pub phases: Vec<PhaseSnapshot>,
    /// Whether this process is currently driving the execution.
    pub attached: bool,
}
