//! Crash recovery: reattaches drivers to executions left `running`.
//!
//! Driver tasks never survive a restart, so any `running` execution whose
//! heartbeat is older than the stale threshold and that this process is
//! not driving is a candidate. Candidates are classified in priority
//! order and handed to [`Orchestrator::resume`], which re-enters at the
//! first phase that is not completed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::pipeline::Orchestrator;
use crate::config::{span_minutes, GlobalConfig, ResumptionConfig};
use crate::models::execution::{Execution, ExecutionStatus};
use crate::models::phase::{PhaseName, PhaseState};
use crate::Result;

/// Why a candidate was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeReason {
    /// Collection was mid-flight and its scope is still in the configuration.
    RelaunchCollection,
    /// Collected URLs still have no content.
    ResumeScraping,
    /// Fetched content is waiting for analysis.
    ResumeAnalysis,
    /// Nothing specific pending, but the execution has been idle too long.
    GenericResume,
}

impl ResumeReason {
    /// Log-friendly name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelaunchCollection => "relaunch_collection",
            Self::ResumeScraping => "resume_scraping",
            Self::ResumeAnalysis => "resume_analysis",
            Self::GenericResume => "generic_resume",
        }
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionOutcome {
    /// Candidate execution.
    pub execution_id: String,
    /// Classification; `None` when the candidate was left alone.
    pub reason: Option<ResumeReason>,
    /// Whether a driver was attached.
    pub resumed: bool,
}

/// Scans for orphaned executions and resumes them.
pub struct ResumptionService {
    orchestrator: Arc<Orchestrator>,
    config: ResumptionConfig,
    min_content_length: i64,
}

impl ResumptionService {
    /// Create the service.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, config: &GlobalConfig) -> Self {
        Self {
            orchestrator,
            config: config.resumption.clone(),
            min_content_length: config.concurrency.min_content_length,
        }
    }

    /// Inspect every stale candidate once. Each candidate is handled on
    /// its own; a failure is logged and does not stop the scan.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the candidates cannot be listed.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<Vec<ResumptionOutcome>> {
        let cutoff = now - span_minutes(self.config.stale_minutes);
        let candidates = self
            .orchestrator
            .store()
            .executions
            .list_stale(ExecutionStatus::Running, cutoff)
            .await?;

        let mut outcomes = Vec::with_capacity(candidates.len());
        for execution in candidates {
            if self.orchestrator.is_attached(&execution.id).await {
                debug!(execution_id = %execution.id, "stale but attached");
                continue;
            }
            let outcome = match self.handle(&execution, now).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(execution_id = %execution.id, %err, "resumption failed");
                    ResumptionOutcome {
                        execution_id: execution.id.clone(),
                        reason: None,
                        resumed: false,
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn handle(&self, execution: &Execution, now: DateTime<Utc>) -> Result<ResumptionOutcome> {
        let reason = self.classify(execution, now).await?;
        let resumed = match reason {
            Some(reason) => {
                info!(execution_id = %execution.id, reason = reason.as_str(), "resuming orphaned execution");
                self.orchestrator.resume(&execution.id, None).await?
            }
            None => {
                debug!(execution_id = %execution.id, "stale but not idle long enough");
                false
            }
        };
        Ok(ResumptionOutcome {
            execution_id: execution.id.clone(),
            reason,
            resumed,
        })
    }

    async fn classify(&self, execution: &Execution, now: DateTime<Utc>) -> Result<Option<ResumeReason>> {
        let store = self.orchestrator.store();
        let collection = store
            .phases
            .get(&execution.id, PhaseName::ResultCollection)
            .await?;
        if collection.status == PhaseState::Running
            && !execution.config.effective_keywords().is_empty()
            && !execution.config.effective_regions().is_empty()
        {
            return Ok(Some(ResumeReason::RelaunchCollection));
        }
        if !store
            .content
            .urls_pending_scrape(&execution.id)
            .await?
            .is_empty()
        {
            return Ok(Some(ResumeReason::ResumeScraping));
        }
        if store
            .content
            .count_ready_unanalyzed(&execution.id, self.min_content_length)
            .await?
            > 0
        {
            return Ok(Some(ResumeReason::ResumeAnalysis));
        }
        if now - execution.updated_at > span_minutes(self.config.idle_minutes) {
            return Ok(Some(ResumeReason::GenericResume));
        }
        Ok(None)
    }

    /// Spawn the periodic rescan. Returns `None` when the interval is zero.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.interval_seconds == 0 {
            return None;
        }
        let period = Duration::from_secs(self.config.interval_seconds);
        Some(tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                // The startup scan already ran.
                interval.tick().await;
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("resumption service shutting down");
                            break;
                        }
                        _ = interval.tick() => match self.scan_once(Utc::now()).await {
                            Ok(outcomes) => {
                                let resumed = outcomes.iter().filter(|o| o.resumed).count();
                                debug!(candidates = outcomes.len(), resumed, "resumption scan finished");
                            }
                            Err(err) => error!(%err, "resumption scan failed"),
                        },
                    }
                }
            }
            .instrument(info_span!("resumption")),
        ))
    }
}
