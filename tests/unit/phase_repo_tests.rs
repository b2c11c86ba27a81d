use std::sync::Arc;

use chrono::{Duration, Utc};
use pipeline_orchestrator::models::execution::{counters, Execution, ExecutionMode};
use pipeline_orchestrator::models::phase::{PhaseName, PhaseState};
use pipeline_orchestrator::models::pipeline::PipelineConfig;
use pipeline_orchestrator::persistence::phase_repo::TransitionDetail;
use pipeline_orchestrator::persistence::{db, StateStore};
use pipeline_orchestrator::AppError;

async fn store_with_execution() -> (StateStore, String) {
    let pool = db::connect_memory().await.expect("db connect");
    let store = StateStore::new(Arc::new(pool));
    let execution = Execution::new(
        PipelineConfig {
            keywords: vec!["rust".into()],
            regions: vec!["us".into()],
            ..PipelineConfig::default()
        },
        ExecutionMode::Manual,
    );
    store.executions.create(&execution).await.expect("create");
    store
        .phases
        .initialize(&execution.id, &PhaseName::ORDER)
        .await
        .expect("initialize");
    (store, execution.id)
}

#[tokio::test]
async fn in_memory_connect_creates_all_tables() {
    let pool = db::connect_memory().await.expect("db connect");
    let tables = [
        "execution",
        "execution_counter",
        "phase_status",
        "keyword_metrics",
        "search_result",
        "enrichment",
        "content",
        "content_analysis",
        "score",
        "health_alert",
        "schedule_config",
        "schedule_execution",
    ];
    for table in tables {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("table '{table}' should be queryable: {e}"));
        assert_eq!(row.0, 0, "table '{table}' should start empty");
    }
}

#[tokio::test]
async fn initialize_creates_pending_rows_in_order() {
    let (store, id) = store_with_execution().await;
    let phases = store.phases.list_for_execution(&id).await.expect("list");

    let names: Vec<PhaseName> = phases.iter().map(|p| p.phase).collect();
    assert_eq!(names, PhaseName::ORDER.to_vec());
    assert!(phases.iter().all(|p| p.status == PhaseState::Pending));
    assert!(phases.iter().all(|p| p.started_at.is_none()));
}

#[tokio::test]
async fn initialize_twice_is_rejected() {
    let (store, id) = store_with_execution().await;
    let err = store
        .phases
        .initialize(&id, &PhaseName::ORDER)
        .await
        .expect_err("second initialize");
    assert!(matches!(err, AppError::AlreadyInitialized(_)));
}

#[tokio::test]
async fn transitions_follow_the_lifecycle() {
    let (store, id) = store_with_execution().await;
    let now = Utc::now();

    let running = store
        .phases
        .transition(&id, PhaseName::Metrics, &[PhaseState::Pending], PhaseState::Running, now)
        .await
        .expect("start");
    assert_eq!(running.status, PhaseState::Running);
    assert!(running.started_at.is_some());
    assert!(running.completed_at.is_none());

    let done = store
        .phases
        .transition_with(
            &id,
            PhaseName::Metrics,
            &[PhaseState::Running],
            PhaseState::Completed,
            now,
            TransitionDetail::result(serde_json::json!({ "keywords": 1 })),
        )
        .await
        .expect("complete");
    assert_eq!(done.status, PhaseState::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.result_data, Some(serde_json::json!({ "keywords": 1 })));
}

#[tokio::test]
async fn illegal_edges_are_rejected_before_touching_the_row() {
    let (store, id) = store_with_execution().await;

    let err = store
        .phases
        .transition(
            &id,
            PhaseName::Metrics,
            &[PhaseState::Pending],
            PhaseState::Completed,
            Utc::now(),
        )
        .await
        .expect_err("pending -> completed");
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let phase = store.phases.get(&id, PhaseName::Metrics).await.expect("get");
    assert_eq!(phase.status, PhaseState::Pending);
}

#[tokio::test]
async fn stale_compare_and_set_loses() {
    let (store, id) = store_with_execution().await;
    let now = Utc::now();
    store
        .phases
        .transition(&id, PhaseName::Scoring, &[PhaseState::Pending], PhaseState::Running, now)
        .await
        .expect("first start");

    let err = store
        .phases
        .transition(&id, PhaseName::Scoring, &[PhaseState::Pending], PhaseState::Running, now)
        .await
        .expect_err("second start");
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn failure_keeps_error_message() {
    let (store, id) = store_with_execution().await;
    let now = Utc::now();
    store
        .phases
        .transition(&id, PhaseName::Scoring, &[PhaseState::Pending], PhaseState::Running, now)
        .await
        .expect("start");
    let failed = store
        .phases
        .transition_with(
            &id,
            PhaseName::Scoring,
            &[PhaseState::Running],
            PhaseState::Failed,
            now,
            TransitionDetail::error("scorer unreachable"),
        )
        .await
        .expect("fail");
    assert_eq!(failed.error_message.as_deref(), Some("scorer unreachable"));
}

#[tokio::test]
async fn reset_returns_any_state_to_pending_with_marker() {
    let (store, id) = store_with_execution().await;
    let now = Utc::now();
    store
        .phases
        .transition(
            &id,
            PhaseName::ContentAnalysis,
            &[PhaseState::Pending],
            PhaseState::Running,
            now,
        )
        .await
        .expect("start");
    store
        .phases
        .transition(
            &id,
            PhaseName::ContentAnalysis,
            &[PhaseState::Running],
            PhaseState::Completed,
            now,
        )
        .await
        .expect("complete");

    let reset = store
        .phases
        .reset(
            &id,
            PhaseName::ContentAnalysis,
            Some(serde_json::json!({ "fresh": true })),
        )
        .await
        .expect("reset");
    assert_eq!(reset.status, PhaseState::Pending);
    assert!(reset.started_at.is_none());
    assert!(reset.completed_at.is_none());
    assert!(reset.fresh_requested());
}

#[tokio::test]
async fn unknown_phase_row_is_not_found() {
    let (store, _) = store_with_execution().await;
    assert!(matches!(
        store.phases.get("missing", PhaseName::Metrics).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        store.phases.reset("missing", PhaseName::Metrics, None).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn list_stale_filters_by_heartbeat() {
    let (store, id) = store_with_execution().await;
    let old = Utc::now() - Duration::hours(3);
    store
        .phases
        .transition(&id, PhaseName::Metrics, &[PhaseState::Pending], PhaseState::Running, old)
        .await
        .expect("start");

    let cutoff = Utc::now() - Duration::hours(1);
    let stale = store
        .phases
        .list_stale(PhaseState::Running, cutoff)
        .await
        .expect("stale");
    assert_eq!(stale.len(), 1);

    store
        .phases
        .heartbeat(&id, PhaseName::Metrics, Utc::now())
        .await
        .expect("heartbeat");
    assert!(store
        .phases
        .list_stale(PhaseState::Running, cutoff)
        .await
        .expect("stale")
        .is_empty());
}

#[tokio::test]
async fn concurrent_counter_increments_are_not_lost() {
    let (store, id) = store_with_execution().await;
    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            store
                .executions
                .increment_counter(&id, counters::CONTENT_ANALYZED, 1)
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("increment");
    }

    let execution = store.executions.require(&id).await.expect("execution");
    assert_eq!(execution.counter(counters::CONTENT_ANALYZED), 20);
}
