//! Phase executors.
//!
//! The orchestrator drives phases through [`PhaseExecutor`]; the built-in
//! executors call the collaborators through a [`CallGuard`] and persist
//! through the [`StateStore`]. Every executor is idempotent: work already
//! persisted is skipped on re-run, so resuming after a crash is safe.
//!
//! Content analysis has no executor here. It is driven by the
//! work-discovery monitor.

pub mod collection;
pub mod enrichment;
pub mod metrics;
pub mod scoring;
pub mod scraping;
pub mod snapshot;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::collaborators::Collaborators;
use crate::models::phase::PhaseName;
use crate::models::pipeline::PipelineConfig;
use crate::persistence::StateStore;
use crate::resilience::CallGuard;
use crate::{AppError, Result};

/// Everything an executor needs for one phase run.
#[derive(Clone)]
pub struct PhaseContext {
    /// Owning execution.
    pub execution_id: String,
    /// Phase being run.
    pub phase: PhaseName,
    /// Execution configuration at phase start.
    pub config: PipelineConfig,
    /// Shared persistence.
    pub store: StateStore,
    /// Fires when the execution is cancelled or the run is stopped.
    pub cancel: CancellationToken,
}

impl PhaseContext {
    /// Refresh the phase and execution heartbeats.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if either update fails.
    pub async fn heartbeat(&self) -> Result<()> {
        let now = Utc::now();
        self.store
            .phases
            .heartbeat(&self.execution_id, self.phase, now)
            .await?;
        self.store.executions.touch(&self.execution_id, now).await
    }

    /// Atomically add `delta` to an execution counter.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn increment(&self, counter: &str, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        self.store
            .executions
            .increment_counter(&self.execution_id, counter, delta)
            .await
    }

    /// Fail fast once the run has been cancelled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if the token has fired.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!(
                "{} of {} cancelled",
                self.phase, self.execution_id
            )));
        }
        Ok(())
    }
}

/// One pluggable phase implementation.
pub trait PhaseExecutor: Send + Sync {
    /// Run the phase to completion and return its result data.
    ///
    /// # Errors
    ///
    /// Any error fails the phase; the orchestrator records it.
    fn run<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// Executors keyed by phase.
#[derive(Clone, Default)]
pub struct PhaseRegistry {
    executors: HashMap<PhaseName, Arc<dyn PhaseExecutor>>,
}

impl PhaseRegistry {
    /// Registry with no executors.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in executor for every phase but analysis.
    #[must_use]
    pub fn builtin(collaborators: &Collaborators, guard: &CallGuard) -> Self {
        let mut registry = Self::empty();
        registry.register(
            PhaseName::Metrics,
            Arc::new(metrics::MetricsPhase::new(
                Arc::clone(&collaborators.metrics),
                guard.clone(),
            )),
        );
        registry.register(
            PhaseName::ResultCollection,
            Arc::new(collection::CollectionPhase::new(
                Arc::clone(&collaborators.collector),
                guard.clone(),
            )),
        );
        registry.register(
            PhaseName::CompanyEnrichment,
            Arc::new(enrichment::EnrichmentPhase::company(
                Arc::clone(&collaborators.company),
                guard.clone(),
            )),
        );
        registry.register(
            PhaseName::VideoEnrichment,
            Arc::new(enrichment::EnrichmentPhase::video(
                Arc::clone(&collaborators.video),
                guard.clone(),
            )),
        );
        registry.register(
            PhaseName::ContentScraping,
            Arc::new(scraping::ScrapingPhase::new(
                Arc::clone(&collaborators.fetcher),
                guard.clone(),
            )),
        );
        registry.register(
            PhaseName::Scoring,
            Arc::new(scoring::ScoringPhase::new(
                Arc::clone(&collaborators.scorer),
                guard.clone(),
            )),
        );
        registry.register(PhaseName::Snapshot, Arc::new(snapshot::SnapshotPhase));
        registry
    }

    /// Install or replace the executor for `phase`.
    pub fn register(&mut self, phase: PhaseName, executor: Arc<dyn PhaseExecutor>) {
        self.executors.insert(phase, executor);
    }

    /// Executor for `phase`, if any.
    #[must_use]
    pub fn get(&self, phase: PhaseName) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors.get(&phase).cloned()
    }
}

/// Per-item outcome counts of a fan-out.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub succeeded: u64,
    pub failed: u64,
    pub last_error: Option<AppError>,
}

impl Tally {
    /// Fail the phase only when every attempted item failed.
    pub fn into_result(self, data: serde_json::Value) -> Result<serde_json::Value> {
        match self.last_error {
            Some(err) if self.succeeded == 0 => Err(err),
            _ => Ok(data),
        }
    }
}

/// Run `work` over `items` with at most `limit` in flight, heartbeating
/// after each completion. Item errors are tallied, never propagated.
pub(crate) async fn fan_out<I, F, Fut>(
    ctx: &PhaseContext,
    items: Vec<I>,
    limit: usize,
    work: F,
) -> Result<Tally>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut outcomes = stream::iter(items)
        .map(|item| {
            let fut = work(item);
            async move {
                ctx.check_cancelled()?;
                fut.await
            }
        })
        .buffer_unordered(limit.max(1));

    let mut tally = Tally::default();
    while let Some(outcome) = outcomes.next().await {
        ctx.check_cancelled()?;
        match outcome {
            Ok(()) => tally.succeeded += 1,
            Err(err) => {
                warn!(
                    execution_id = %ctx.execution_id,
                    phase = %ctx.phase,
                    %err,
                    "phase item failed"
                );
                tally.failed += 1;
                tally.last_error = Some(err);
            }
        }
        ctx.heartbeat().await?;
    }
    Ok(tally)
}
