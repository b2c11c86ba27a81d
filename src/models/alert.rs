//! Health alert model for long-running executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status for a health alert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Execution is still running past the alert threshold.
    Active,
    /// Execution settled; alert kept until cleanup deletes it.
    Resolved,
}

impl AlertStatus {
    /// Persisted name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
        }
    }
}

/// A watchdog notification raised by the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthAlert {
    /// Unique record identifier.
    pub id: String,
    /// Execution the alert concerns.
    pub execution_id: String,
    /// Human-readable reason.
    pub message: String,
    /// Runtime in minutes when the alert was raised.
    pub runtime_minutes: i64,
    /// Current lifecycle status.
    pub status: AlertStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When the alert was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HealthAlert {
    /// Construct a new active alert.
    #[must_use]
    pub fn new(execution_id: String, message: String, runtime_minutes: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id,
            message,
            runtime_minutes,
            status: AlertStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}
