//! Integration tests for execution history retention.
//!
//! Validates:
//! - Settled executions past the cutoff are deleted with every child record
//! - Running and recently settled executions remain untouched
//! - Single-execution purge removes one execution regardless of status

use std::sync::Arc;

use chrono::{Duration, Utc};

use pipeline_orchestrator::models::alert::HealthAlert;
use pipeline_orchestrator::models::execution::{Execution, ExecutionMode, ExecutionStatus};
use pipeline_orchestrator::models::phase::PhaseName;
use pipeline_orchestrator::models::work_item::DimensionScores;
use pipeline_orchestrator::persistence::retention;

use super::test_helpers::{pipeline, seed_content, seed_results, test_app, FakeProviders};

/// Persist an execution in `status` whose heartbeat is `days_ago` old, with
/// phases, results, content, an analysis and an alert.
async fn seeded_execution(
    app: &pipeline_orchestrator::app::AppState,
    status: ExecutionStatus,
    days_ago: i64,
) -> String {
    let mut execution = Execution::new(pipeline("rust"), ExecutionMode::Manual);
    execution.status = status;
    execution.updated_at = Utc::now() - Duration::days(days_ago);
    app.store.executions.create(&execution).await.expect("create execution");
    app.store
        .phases
        .initialize(&execution.id, &PhaseName::ORDER)
        .await
        .expect("phases");

    let urls = seed_results(app, &execution.id, 2).await;
    seed_content(app, &execution.id, &urls, 300).await;
    app.store
        .content
        .record_analysis(&execution.id, &urls[0], &DimensionScores::default(), None)
        .await
        .expect("analysis");
    app.store
        .alerts
        .create(&HealthAlert::new(execution.id.clone(), "long run".into(), 1_500))
        .await
        .expect("alert");
    execution.id
}

/// Only settled executions older than the cutoff are purged, children
/// included.
#[tokio::test]
async fn purge_removes_only_expired_settled_executions() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let expired = seeded_execution(&app, ExecutionStatus::Completed, 100).await;
    let recent = seeded_execution(&app, ExecutionStatus::Failed, 10).await;
    let running = seeded_execution(&app, ExecutionStatus::Running, 100).await;

    let cutoff = Utc::now() - Duration::days(90);
    let purged = retention::purge_settled_before(app.store.db(), cutoff)
        .await
        .expect("purge");
    assert_eq!(purged, 1);

    assert!(app
        .store
        .executions
        .get_by_id(&expired)
        .await
        .expect("lookup")
        .is_none());
    assert!(app
        .store
        .phases
        .list_for_execution(&expired)
        .await
        .expect("phases")
        .is_empty());
    assert_eq!(app.store.content.count_results(&expired).await.expect("results"), 0);
    assert_eq!(app.store.content.count_analyses(&expired).await.expect("analyses"), 0);

    for kept in [&recent, &running] {
        assert!(app.store.executions.get_by_id(kept).await.expect("lookup").is_some());
        assert_eq!(app.store.content.count_results(kept).await.expect("results"), 2);
        assert_eq!(
            app.store.phases.list_for_execution(kept).await.expect("phases").len(),
            PhaseName::ORDER.len()
        );
    }
    let alerts = app.store.alerts.list_active().await.expect("alerts");
    assert_eq!(alerts.len(), 2);
    assert!(alerts.iter().all(|a| a.execution_id != expired));
}

/// A second purge with nothing expired is a no-op.
#[tokio::test]
async fn purge_is_idempotent() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    seeded_execution(&app, ExecutionStatus::Cancelled, 120).await;

    let cutoff = Utc::now() - Duration::days(90);
    assert_eq!(
        retention::purge_settled_before(app.store.db(), cutoff)
            .await
            .expect("first purge"),
        1
    );
    assert_eq!(
        retention::purge_settled_before(app.store.db(), cutoff)
            .await
            .expect("second purge"),
        0
    );
}

/// Purging one execution removes it regardless of status and reports
/// unknown ids.
#[tokio::test]
async fn purge_execution_removes_one_execution() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let target = seeded_execution(&app, ExecutionStatus::Running, 0).await;
    let other = seeded_execution(&app, ExecutionStatus::Running, 0).await;

    assert!(retention::purge_execution(app.store.db(), &target)
        .await
        .expect("purge"));
    assert!(!retention::purge_execution(app.store.db(), &target)
        .await
        .expect("purge again"));

    assert!(app.store.executions.get_by_id(&target).await.expect("lookup").is_none());
    assert_eq!(app.store.content.count_results(&target).await.expect("results"), 0);
    assert!(app.store.executions.get_by_id(&other).await.expect("lookup").is_some());
}
