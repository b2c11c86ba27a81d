//! Snapshot phase: freezes the execution's headline numbers into the
//! phase result.

use futures_util::future::BoxFuture;

use super::{PhaseContext, PhaseExecutor};
use crate::Result;

/// Records a summary of everything the execution produced.
pub struct SnapshotPhase;

impl PhaseExecutor for SnapshotPhase {
    fn run<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let content = &ctx.store.content;
            let id = ctx.execution_id.as_str();
            let counters = ctx.store.executions.counters(id).await?;
            Ok(serde_json::json!({
                "results": content.count_results(id).await?,
                "analyses": content.count_analyses(id).await?,
                "scores": content.count_scores(id).await?,
                "counters": counters,
            }))
        })
    }
}
