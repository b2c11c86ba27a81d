//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::phase::PhaseName;
use crate::{AppError, Result};

/// Longest span any time-based setting may express (100 years).
pub const MAX_SPAN_MINUTES: i64 = 100 * 366 * 24 * 60;

/// Minutes as a chrono span, clamped to `0..=MAX_SPAN_MINUTES`.
#[must_use]
pub fn span_minutes(minutes: i64) -> chrono::Duration {
    chrono::Duration::minutes(minutes.clamp(0, MAX_SPAN_MINUTES))
}

/// Hours as a clamped chrono span.
#[must_use]
pub fn span_hours(hours: u64) -> chrono::Duration {
    span_minutes(i64::try_from(hours.saturating_mul(60)).unwrap_or(MAX_SPAN_MINUTES))
}

/// Days as a clamped chrono span.
#[must_use]
pub fn span_days(days: u64) -> chrono::Duration {
    span_hours(days.saturating_mul(24))
}

/// Seconds as a chrono span, clamped like [`span_minutes`].
#[must_use]
pub fn span_seconds(seconds: i64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.clamp(0, MAX_SPAN_MINUTES * 60))
}

fn check_span(key: &str, minutes: Option<i64>) -> Result<()> {
    match minutes {
        Some(m) if (0..=MAX_SPAN_MINUTES).contains(&m) => Ok(()),
        _ => Err(AppError::Config(format!(
            "{key} must be between zero and {} days",
            MAX_SPAN_MINUTES / (24 * 60)
        ))),
    }
}

fn hours_as_minutes(hours: u64) -> Option<i64> {
    i64::try_from(hours).ok()?.checked_mul(60)
}

/// Bounds on external work shared by every concurrent monitor batch.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ConcurrencyConfig {
    /// Size of the process-wide semaphore gating external calls.
    pub global_limit: usize,
    /// Work items pulled per discovery batch.
    pub batch_size: usize,
    /// Content shorter than this (in characters) is never analyzed.
    pub min_content_length: i64,
    /// Work-discovery tick interval.
    pub monitor_tick_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_limit: 50,
            batch_size: 10,
            min_content_length: 200,
            monitor_tick_ms: 5_000,
        }
    }
}

/// Health monitor cadence and timeout table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct HealthConfig {
    /// Seconds between health ticks.
    pub interval_seconds: u64,
    /// Hard ceiling on total execution runtime.
    pub max_runtime_hours: u64,
    /// Run the alert check and cleanup every N ticks.
    pub alert_every_ticks: u64,
    /// Executions running longer than this raise a health alert.
    pub long_running_alert_hours: u64,
    /// Resolved alerts older than this are deleted.
    pub alert_retention_hours: u64,
    /// Heartbeat timeout per phase, in minutes.
    pub phase_timeouts_minutes: HashMap<PhaseName, u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            max_runtime_hours: 48,
            alert_every_ticks: 5,
            long_running_alert_hours: 24,
            alert_retention_hours: 168,
            phase_timeouts_minutes: HashMap::new(),
        }
    }
}

impl HealthConfig {
    /// Timeout for a phase, falling back to the built-in table.
    #[must_use]
    pub fn phase_timeout(&self, phase: PhaseName) -> chrono::Duration {
        let minutes = self
            .phase_timeouts_minutes
            .get(&phase)
            .copied()
            .unwrap_or_else(|| phase.default_timeout_minutes());
        span_minutes(i64::try_from(minutes).unwrap_or(MAX_SPAN_MINUTES))
    }
}

/// Crash-recovery scan thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ResumptionConfig {
    /// Running executions quieter than this are inspected.
    pub stale_minutes: i64,
    /// Executions idle longer than this get a generic resume.
    pub idle_minutes: i64,
    /// Periodic rescan interval; 0 runs the scan only at startup.
    pub interval_seconds: u64,
}

impl Default for ResumptionConfig {
    fn default() -> Self {
        Self {
            stale_minutes: 5,
            idle_minutes: 10,
            interval_seconds: 300,
        }
    }
}

/// Recurrence scheduler settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SchedulerConfig {
    /// Whether the scheduler loop runs under `serve`.
    pub enabled: bool,
    /// Seconds between scheduler ticks.
    pub interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
        }
    }
}

/// Per-dependency circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls.
    pub open_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_seconds: 60,
        }
    }
}

/// Exponential backoff for transient collaborator errors.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

/// Orchestrator behaviour knobs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct OrchestratorConfig {
    /// A second `start` within this window returns the running execution.
    pub duplicate_window_seconds: i64,
    /// Poll interval used while waiting for an execution to finish.
    pub completion_poll_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            duplicate_window_seconds: 15,
            completion_poll_ms: 5_000,
        }
    }
}

/// HTTP endpoints backing the external collaborators.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", default)]
pub struct ProvidersConfig {
    /// Keyword metrics endpoint.
    pub metrics_url: Option<String>,
    /// Search-results endpoint.
    pub collector_url: Option<String>,
    /// Scraping endpoint.
    pub fetcher_url: Option<String>,
    /// Company-data endpoint.
    pub company_url: Option<String>,
    /// Video-metadata endpoint.
    pub video_url: Option<String>,
    /// Language-model analysis endpoint.
    pub analyzer_url: Option<String>,
    /// Scoring endpoint.
    pub scorer_url: Option<String>,
    /// Per-request timeout.
    pub request_timeout_seconds: Option<u64>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/pipeline.db")
}

fn default_retention_days() -> u32 {
    90
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Days after an execution terminates before its history is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Work-discovery concurrency.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Health monitor settings.
    #[serde(default)]
    pub health: HealthConfig,
    /// Resumption service settings.
    #[serde(default)]
    pub resumption: ResumptionConfig,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Orchestrator settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Collaborator endpoints.
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: default_retention_days(),
            concurrency: ConcurrencyConfig::default(),
            health: HealthConfig::default(),
            resumption: ResumptionConfig::default(),
            scheduler: SchedulerConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of discovery batches allowed in flight at once.
    ///
    /// Derived as `global_limit / batch_size`, never less than one.
    #[must_use]
    pub fn max_concurrent_batches(&self) -> usize {
        (self.concurrency.global_limit / self.concurrency.batch_size.max(1)).max(1)
    }

    /// Work-discovery tick interval.
    #[must_use]
    pub fn monitor_tick(&self) -> Duration {
        Duration::from_millis(self.concurrency.monitor_tick_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency.global_limit == 0 {
            return Err(AppError::Config(
                "concurrency.global_limit must be greater than zero".into(),
            ));
        }
        if self.concurrency.batch_size == 0 {
            return Err(AppError::Config(
                "concurrency.batch_size must be greater than zero".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.failure_threshold must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }
        if self.resumption.idle_minutes < self.resumption.stale_minutes {
            return Err(AppError::Config(
                "resumption.idle_minutes must not be below stale_minutes".into(),
            ));
        }
        if self.health.interval_seconds == 0 || self.scheduler.interval_seconds == 0 {
            return Err(AppError::Config("loop intervals must be non-zero".into()));
        }
        self.validate_spans()
    }

    fn validate_spans(&self) -> Result<()> {
        check_span(
            "retention_days",
            hours_as_minutes(u64::from(self.retention_days).saturating_mul(24)),
        )?;
        check_span(
            "health.max_runtime_hours",
            hours_as_minutes(self.health.max_runtime_hours),
        )?;
        check_span(
            "health.long_running_alert_hours",
            hours_as_minutes(self.health.long_running_alert_hours),
        )?;
        check_span(
            "health.alert_retention_hours",
            hours_as_minutes(self.health.alert_retention_hours),
        )?;
        for (phase, minutes) in &self.health.phase_timeouts_minutes {
            check_span(
                &format!("health.phase_timeouts_minutes.{}", phase.as_str()),
                i64::try_from(*minutes).ok(),
            )?;
        }
        check_span("resumption.stale_minutes", Some(self.resumption.stale_minutes))?;
        check_span("resumption.idle_minutes", Some(self.resumption.idle_minutes))?;
        check_span(
            "orchestrator.duplicate_window_seconds",
            Some(self.orchestrator.duplicate_window_seconds / 60),
        )?;
        if self.orchestrator.duplicate_window_seconds < 0 {
            return Err(AppError::Config(
                "orchestrator.duplicate_window_seconds must not be negative".into(),
            ));
        }
        Ok(())
    }
}
