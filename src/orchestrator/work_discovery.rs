//! Concurrent work-discovery monitor.
//!
//! Polls the store for fetched content that has not been analyzed and
//! analyzes it in batches while upstream phases are still producing it.
//! Concurrency is bounded twice: at most `max_concurrent_batches` batches
//! are in flight, and every analyzer call holds one permit of the global
//! semaphore inside the [`CallGuard`].
//!
//! The processed/failed sets live only for one monitor session. After a
//! crash, "already analyzed" is re-derived from persisted analysis rows.
//! A fresh session ignores those rows and relies on the session sets alone,
//! so content that arrives mid-session is still claimed exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::collaborators::{deps, ContentAnalyzer};
use crate::config::GlobalConfig;
use crate::models::execution::counters;
use crate::models::phase::PhaseName;
use crate::models::pipeline::PipelineConfig;
use crate::models::work_item::{validate_dimensions, AnalysisDimension, PrimaryDimensionPolicy, WorkItem};
use crate::persistence::StateStore;
use crate::resilience::CallGuard;
use crate::Result;

/// Loop tuning shared by every monitor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Items per discovery batch.
    pub batch_size: usize,
    /// Batches allowed in flight at once.
    pub max_concurrent_batches: usize,
    /// Shorter content is never analyzed.
    pub min_content_length: i64,
    /// Sleep between discovery passes.
    pub tick: Duration,
}

impl MonitorSettings {
    /// Derive settings from the `[concurrency]` section.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            batch_size: config.concurrency.batch_size.max(1),
            max_concurrent_batches: config.max_concurrent_batches(),
            min_content_length: config.concurrency.min_content_length,
            tick: config.monitor_tick(),
        }
    }
}

/// Immutable per-session analysis context.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisContext {
    /// Execution whose content is analyzed.
    pub execution_id: String,
    /// Dimensions handed to the analyzer.
    pub dimensions: Vec<AnalysisDimension>,
    /// Primary dimension selection.
    pub policy: PrimaryDimensionPolicy,
    /// Reprocess everything once, ignoring prior analyses.
    pub fresh: bool,
    /// Retry transient failures without backoff.
    pub skip_delays: bool,
}

impl AnalysisContext {
    /// Context for `execution_id` from its pipeline configuration.
    #[must_use]
    pub fn from_pipeline(execution_id: &str, config: &PipelineConfig, fresh: bool) -> Self {
        Self {
            execution_id: execution_id.to_owned(),
            dimensions: config.analysis_dimensions.clone(),
            policy: config.primary_dimension_policy,
            fresh: fresh || config.fresh_analysis,
            skip_delays: config.skip_delays(),
        }
    }
}

/// Outcome of one item in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    /// Item URL.
    pub url: String,
    /// `Ok` once the analysis is persisted and counted.
    pub result: Result<()>,
}

/// All outcomes of one batch; always one per submitted item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Outcomes in submission order.
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    /// Number of successful items.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    /// Number of failed items.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Totals for one monitor session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    /// Batches launched.
    pub batches: usize,
    /// Items analyzed.
    pub analyzed: usize,
    /// Items that failed.
    pub failed: usize,
    /// Session ended by `stop_monitoring` rather than draining.
    pub cancelled: bool,
}

#[derive(Default)]
struct Session {
    in_flight: HashSet<String>,
    processed: HashSet<String>,
    failed: HashSet<String>,
    summary: MonitorSummary,
}

impl Session {
    fn excluded(&self) -> HashSet<String> {
        self.in_flight
            .iter()
            .chain(&self.processed)
            .chain(&self.failed)
            .cloned()
            .collect()
    }

    fn settle(&mut self, report: BatchReport) {
        for outcome in report.outcomes {
            self.in_flight.remove(&outcome.url);
            match outcome.result {
                Ok(()) => {
                    self.summary.analyzed += 1;
                    self.processed.insert(outcome.url);
                }
                Err(err) => {
                    warn!(url = %outcome.url, %err, "analysis failed");
                    self.summary.failed += 1;
                    self.failed.insert(outcome.url);
                }
            }
        }
    }
}

/// Discovers ready content and analyzes it at bounded concurrency.
#[derive(Clone)]
pub struct WorkDiscoveryMonitor {
    store: StateStore,
    analyzer: Arc<dyn ContentAnalyzer>,
    guard: CallGuard,
    settings: MonitorSettings,
}

/// Control handle for one running monitor session.
pub struct MonitorHandle {
    execution_id: String,
    cancel: CancellationToken,
    upstream: watch::Sender<bool>,
    join: Option<JoinHandle<MonitorSummary>>,
}

impl MonitorHandle {
    /// Execution being monitored.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Tell the loop that no more content will arrive, so it exits once
    /// everything discovered has been processed.
    pub fn mark_upstream_complete(&self) {
        self.upstream.send_replace(true);
    }

    /// Whether the loop task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the loop to drain after [`mark_upstream_complete`](Self::mark_upstream_complete).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if the loop task panicked or was aborted.
    pub async fn wait_for_drain(&mut self) -> Result<MonitorSummary> {
        match self.join.take() {
            Some(join) => join.await.map_err(join_error),
            None => Ok(MonitorSummary::default()),
        }
    }

    /// Cancel the loop and every in-flight batch, returning only once
    /// they have all stopped.
    pub async fn stop_monitoring(mut self) -> MonitorSummary {
        self.cancel.cancel();
        match self.join.take() {
            Some(join) => join.await.unwrap_or_else(|err| {
                warn!(execution_id = %self.execution_id, %err, "monitor task ended abnormally");
                MonitorSummary {
                    cancelled: true,
                    ..MonitorSummary::default()
                }
            }),
            None => MonitorSummary::default(),
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn join_error(err: JoinError) -> crate::AppError {
    crate::AppError::Cancelled(format!("monitor task ended abnormally: {err}"))
}

impl WorkDiscoveryMonitor {
    /// Create the monitor. `guard` must carry the process-wide semaphore.
    #[must_use]
    pub fn new(
        store: StateStore,
        analyzer: Arc<dyn ContentAnalyzer>,
        guard: CallGuard,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            store,
            analyzer,
            guard,
            settings,
        }
    }

    /// Loop settings.
    #[must_use]
    pub fn settings(&self) -> MonitorSettings {
        self.settings
    }

    /// Validate the analysis configuration and start the loop.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the dimension set is empty or invalid;
    /// nothing is spawned in that case.
    pub fn start_monitoring(&self, ctx: AnalysisContext) -> Result<MonitorHandle> {
        validate_dimensions(&ctx.dimensions)?;

        let cancel = CancellationToken::new();
        let (upstream, upstream_rx) = watch::channel(false);
        let execution_id = ctx.execution_id.clone();
        let span = info_span!("work_discovery", execution_id = %execution_id, fresh = ctx.fresh);
        let join = tokio::spawn(
            self.clone()
                .run(Arc::new(ctx), cancel.clone(), upstream_rx)
                .instrument(span),
        );
        info!(execution_id = %execution_id, "work discovery started");

        Ok(MonitorHandle {
            execution_id,
            cancel,
            upstream,
            join: Some(join),
        })
    }

    async fn run(
        self,
        ctx: Arc<AnalysisContext>,
        cancel: CancellationToken,
        mut upstream: watch::Receiver<bool>,
    ) -> MonitorSummary {
        let mut session = Session::default();
        let mut batches: JoinSet<BatchReport> = JoinSet::new();

        loop {
            while let Some(joined) = batches.try_join_next() {
                reap(&mut session, joined);
            }

            let upstream_done = *upstream.borrow_and_update();
            let mut launched = 0;
            while batches.len() < self.settings.max_concurrent_batches {
                if cancel.is_cancelled() {
                    break;
                }
                let items = match self.discover(&ctx, &session).await {
                    Ok(items) => items,
                    Err(err) => {
                        warn!(%err, "work discovery query failed");
                        break;
                    }
                };
                if items.is_empty() {
                    break;
                }
                session
                    .in_flight
                    .extend(items.iter().map(|item| item.url.clone()));
                session.summary.batches += 1;
                launched += 1;
                debug!(items = items.len(), in_flight = batches.len() + 1, "batch launched");

                let monitor = self.clone();
                let batch_ctx = Arc::clone(&ctx);
                batches.spawn(async move { monitor.process_batch(&batch_ctx, items).await });
            }

            if upstream_done && launched == 0 && batches.is_empty() {
                info!(
                    analyzed = session.summary.analyzed,
                    failed = session.summary.failed,
                    "work discovery drained"
                );
                return session.summary;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    batches.shutdown().await;
                    info!("work discovery stopped");
                    session.summary.cancelled = true;
                    return session.summary;
                }
                () = tokio::time::sleep(self.settings.tick) => {}
                Some(joined) = batches.join_next(), if !batches.is_empty() => {
                    reap(&mut session, joined);
                }
                changed = upstream.changed(), if !upstream_done => {
                    if changed.is_err() {
                        debug!("upstream signal dropped");
                    }
                }
            }
        }
    }

    async fn discover(&self, ctx: &AnalysisContext, session: &Session) -> Result<Vec<WorkItem>> {
        let content = &self.store.content;
        let excluded = session.excluded();
        if ctx.fresh {
            content
                .ready_for_reanalysis(
                    &ctx.execution_id,
                    self.settings.min_content_length,
                    self.settings.batch_size,
                    &excluded,
                )
                .await
        } else {
            content
                .ready_unanalyzed(
                    &ctx.execution_id,
                    self.settings.min_content_length,
                    self.settings.batch_size,
                    &excluded,
                )
                .await
        }
    }

    /// Analyze every item concurrently and report exactly one outcome per
    /// item. Never fails as a whole.
    pub async fn process_batch(&self, ctx: &AnalysisContext, items: Vec<WorkItem>) -> BatchReport {
        let outcomes = join_all(items.iter().map(|item| async move {
            ItemOutcome {
                url: item.url.clone(),
                result: self.process_item(ctx, item).await,
            }
        }))
        .await;

        if let Err(err) = self
            .store
            .phases
            .heartbeat(&ctx.execution_id, PhaseName::ContentAnalysis, Utc::now())
            .await
        {
            warn!(%err, "analysis heartbeat failed");
        }
        BatchReport { outcomes }
    }

    async fn process_item(&self, ctx: &AnalysisContext, item: &WorkItem) -> Result<()> {
        let scores = self
            .guard
            .call(deps::ANALYZER, ctx.skip_delays, || {
                self.analyzer
                    .analyze(&item.url, &item.body, &item.metadata, &ctx.dimensions)
            })
            .await?;
        let primary = ctx.policy.select(&ctx.dimensions, &scores);
        self.store
            .content
            .record_analysis(&ctx.execution_id, &item.url, &scores, primary.as_deref())
            .await?;
        self.store
            .executions
            .increment_counter(&ctx.execution_id, counters::CONTENT_ANALYZED, 1)
            .await
    }
}

fn reap(session: &mut Session, joined: std::result::Result<BatchReport, JoinError>) {
    match joined {
        Ok(report) => session.settle(report),
        Err(err) => warn!(%err, "analysis batch task ended abnormally"),
    }
}
