//! Company and video enrichment phases.
//!
//! Company enrichment looks up every distinct result domain; video
//! enrichment looks up every video result URL. A target the provider does
//! not know, or permanently rejects, is recorded with no profile so it is
//! not looked up again.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::debug;

use super::{fan_out, PhaseContext, PhaseExecutor};
use crate::collaborators::{deps, Enricher};
use crate::models::execution::counters;
use crate::persistence::content_repo::EnrichmentKind;
use crate::resilience::CallGuard;
use crate::{AppError, Result};

/// Enriches results with provider profiles.
pub struct EnrichmentPhase {
    kind: EnrichmentKind,
    dependency: &'static str,
    counter: &'static str,
    enricher: Arc<dyn Enricher>,
    guard: CallGuard,
}

impl EnrichmentPhase {
    /// Company-data enrichment keyed by domain.
    #[must_use]
    pub fn company(enricher: Arc<dyn Enricher>, guard: CallGuard) -> Self {
        Self {
            kind: EnrichmentKind::Company,
            dependency: deps::COMPANY,
            counter: counters::DOMAINS_ENRICHED,
            enricher,
            guard,
        }
    }

    /// Video-metadata enrichment keyed by URL.
    #[must_use]
    pub fn video(enricher: Arc<dyn Enricher>, guard: CallGuard) -> Self {
        Self {
            kind: EnrichmentKind::Video,
            dependency: deps::VIDEO,
            counter: counters::VIDEOS_ENRICHED,
            enricher,
            guard,
        }
    }

    async fn enrich_one(&self, ctx: &PhaseContext, target: String) -> Result<()> {
        let outcome = self
            .guard
            .call(self.dependency, ctx.config.skip_delays(), || {
                self.enricher.enrich(&target)
            })
            .await;
        let profile = match outcome {
            Ok(profile) => profile,
            Err(AppError::Permanent(reason)) => {
                debug!(target = %target, %reason, "enrichment target rejected");
                None
            }
            Err(err) => return Err(err),
        };
        ctx.store
            .content
            .record_enrichment(&ctx.execution_id, self.kind, &target, profile.as_ref())
            .await?;
        ctx.increment(self.counter, 1).await
    }
}

impl PhaseExecutor for EnrichmentPhase {
    fn run<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let targets = ctx
                .store
                .content
                .pending_enrichment_targets(&ctx.execution_id, self.kind)
                .await?;
            let total = targets.len();

            let tally = fan_out(ctx, targets, ctx.config.max_concurrent_enrichment, |target| {
                self.enrich_one(ctx, target)
            })
            .await?;

            let data = serde_json::json!({
                "targets": total,
                "enriched": tally.succeeded,
                "failed": tally.failed,
            });
            tally.into_result(data)
        })
    }
}
