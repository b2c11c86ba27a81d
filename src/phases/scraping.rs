//! Content scraping phase.
//!
//! Pages that are gone are recorded as failed content rows and never
//! fetched again; transient failures leave the URL pending for a later run.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::{fan_out, PhaseContext, PhaseExecutor};
use crate::collaborators::{deps, ContentFetcher};
use crate::models::execution::counters;
use crate::resilience::CallGuard;
use crate::{AppError, Result};

/// Fetches the page behind every collected result.
pub struct ScrapingPhase {
    fetcher: Arc<dyn ContentFetcher>,
    guard: CallGuard,
}

impl ScrapingPhase {
    /// Create the executor.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ContentFetcher>, guard: CallGuard) -> Self {
        Self { fetcher, guard }
    }

    async fn scrape_one(&self, ctx: &PhaseContext, url: String) -> Result<()> {
        let outcome = self
            .guard
            .call(deps::FETCHER, ctx.config.skip_delays(), || self.fetcher.fetch(&url))
            .await;
        match outcome {
            Ok(content) => {
                ctx.store
                    .content
                    .record_content(&ctx.execution_id, &url, &content.body)
                    .await?;
                ctx.increment(counters::CONTENT_SCRAPED, 1).await
            }
            Err(AppError::Permanent(reason)) => {
                ctx.store
                    .content
                    .record_fetch_failure(&ctx.execution_id, &url, &reason)
                    .await?;
                Err(AppError::Permanent(reason))
            }
            Err(err) => Err(err),
        }
    }
}

impl PhaseExecutor for ScrapingPhase {
    fn run<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let urls = ctx
                .store
                .content
                .urls_pending_scrape(&ctx.execution_id)
                .await?;
            let total = urls.len();

            let tally = fan_out(ctx, urls, ctx.config.max_concurrent_scraping, |url| {
                self.scrape_one(ctx, url)
            })
            .await?;

            let data = serde_json::json!({
                "urls": total,
                "scraped": tally.succeeded,
                "failed": tally.failed,
            });
            tally.into_result(data)
        })
    }
}
