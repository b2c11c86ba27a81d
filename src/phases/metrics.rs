//! Keyword metrics phase.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::{fan_out, PhaseContext, PhaseExecutor};
use crate::collaborators::{deps, KeywordMetricsProvider, MetricsQuery};
use crate::models::execution::counters;
use crate::resilience::CallGuard;
use crate::Result;

/// Looks up search demand for every keyword and region in scope.
pub struct MetricsPhase {
    provider: Arc<dyn KeywordMetricsProvider>,
    guard: CallGuard,
}

impl MetricsPhase {
    /// Create the executor.
    #[must_use]
    pub fn new(provider: Arc<dyn KeywordMetricsProvider>, guard: CallGuard) -> Self {
        Self { provider, guard }
    }

    async fn measure(&self, ctx: &PhaseContext, query: MetricsQuery) -> Result<()> {
        let store = &ctx.store.content;
        if !query.force_refresh
            && store
                .has_keyword_metrics(&ctx.execution_id, &query.keyword, &query.region)
                .await?
        {
            return Ok(());
        }

        let metrics = self
            .guard
            .call(deps::METRICS, ctx.config.skip_delays(), || {
                self.provider.metrics(&query)
            })
            .await?;
        store
            .upsert_keyword_metrics(&ctx.execution_id, &query.keyword, &query.region, &metrics)
            .await?;
        ctx.increment(counters::KEYWORDS_MEASURED, 1).await
    }
}

impl PhaseExecutor for MetricsPhase {
    fn run<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let queries: Vec<MetricsQuery> = ctx
                .config
                .effective_keywords()
                .iter()
                .flat_map(|keyword| {
                    ctx.config.effective_regions().iter().map(|region| MetricsQuery {
                        keyword: keyword.clone(),
                        region: region.clone(),
                        force_refresh: ctx.config.force_refresh,
                    })
                })
                .collect();
            let total = queries.len();

            let tally = fan_out(ctx, queries, ctx.config.max_concurrent_metrics, |query| {
                self.measure(ctx, query)
            })
            .await?;

            let data = serde_json::json!({
                "queries": total,
                "measured": tally.succeeded,
                "failed": tally.failed,
            });
            tally.into_result(data)
        })
    }
}
