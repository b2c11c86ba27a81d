//! Scoring phase.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::{PhaseContext, PhaseExecutor};
use crate::collaborators::{deps, ScoreCalculator};
use crate::models::execution::counters;
use crate::resilience::CallGuard;
use crate::Result;

/// Computes the aggregate score once analysis has finished.
pub struct ScoringPhase {
    scorer: Arc<dyn ScoreCalculator>,
    guard: CallGuard,
}

impl ScoringPhase {
    /// Create the executor.
    #[must_use]
    pub fn new(scorer: Arc<dyn ScoreCalculator>, guard: CallGuard) -> Self {
        Self { scorer, guard }
    }
}

impl PhaseExecutor for ScoringPhase {
    fn run<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            ctx.check_cancelled()?;
            let score = self
                .guard
                .call(deps::SCORER, ctx.config.skip_delays(), || {
                    self.scorer.compute(&ctx.execution_id)
                })
                .await?;
            ctx.store
                .content
                .record_score(&ctx.execution_id, &score)
                .await?;
            ctx.increment(counters::SCORES_COMPUTED, 1).await?;
            ctx.heartbeat().await?;
            Ok(serde_json::json!({ "score": score.value }))
        })
    }
}
