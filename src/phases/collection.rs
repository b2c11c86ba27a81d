//! Result collection phase.
//!
//! Either collects fresh results for every keyword, region and content
//! type in scope, or copies the results of an earlier execution when
//! `reuse_results_from_execution_id` is set.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::info;

use super::{fan_out, PhaseContext, PhaseExecutor};
use crate::collaborators::{deps, CollectQuery, ResultCollector};
use crate::models::execution::counters;
use crate::resilience::CallGuard;
use crate::{AppError, Result};

/// Collects ranked search results.
pub struct CollectionPhase {
    collector: Arc<dyn ResultCollector>,
    guard: CallGuard,
}

impl CollectionPhase {
    /// Create the executor.
    #[must_use]
    pub fn new(collector: Arc<dyn ResultCollector>, guard: CallGuard) -> Self {
        Self { collector, guard }
    }

    async fn collect_one(&self, ctx: &PhaseContext, query: CollectQuery) -> Result<()> {
        let store = &ctx.store.content;
        if !query.force_refresh
            && store
                .has_results_for(
                    &ctx.execution_id,
                    &query.keyword,
                    &query.region,
                    query.content_type.as_str(),
                )
                .await?
        {
            return Ok(());
        }

        let results = self
            .guard
            .call(deps::COLLECTOR, ctx.config.skip_delays(), || {
                self.collector.collect(&query)
            })
            .await?;
        let inserted = store.insert_results(&ctx.execution_id, &results).await?;
        ctx.increment(
            counters::RESULTS_COLLECTED,
            i64::try_from(inserted).unwrap_or(i64::MAX),
        )
        .await
    }

    async fn reuse(&self, ctx: &PhaseContext, source: &str) -> Result<serde_json::Value> {
        if ctx.store.executions.get_by_id(source).await?.is_none() {
            return Err(AppError::NotFound(format!(
                "execution {source} to reuse results from"
            )));
        }
        let copied = ctx
            .store
            .content
            .copy_results(source, &ctx.execution_id)
            .await?;
        ctx.increment(
            counters::RESULTS_COLLECTED,
            i64::try_from(copied).unwrap_or(i64::MAX),
        )
        .await?;
        ctx.heartbeat().await?;
        info!(execution_id = %ctx.execution_id, source, copied, "reused prior results");
        Ok(serde_json::json!({ "reused_from": source, "copied": copied }))
    }
}

impl PhaseExecutor for CollectionPhase {
    fn run<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            if let Some(source) = &ctx.config.reuse_results_from_execution_id {
                return self.reuse(ctx, source).await;
            }

            let mut queries = Vec::new();
            for keyword in ctx.config.effective_keywords() {
                for region in ctx.config.effective_regions() {
                    for content_type in &ctx.config.content_types {
                        queries.push(CollectQuery {
                            keyword: keyword.clone(),
                            region: region.clone(),
                            content_type: *content_type,
                            force_refresh: ctx.config.force_refresh,
                        });
                    }
                }
            }
            let total = queries.len();

            let tally = fan_out(ctx, queries, ctx.config.max_concurrent_collection, |query| {
                self.collect_one(ctx, query)
            })
            .await?;

            let stored = ctx.store.content.count_results(&ctx.execution_id).await?;
            let data = serde_json::json!({
                "queries": total,
                "succeeded": tally.succeeded,
                "failed": tally.failed,
                "results": stored,
            });
            tally.into_result(data)
        })
    }
}
