//! Tests for crash resumption of orphaned executions.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};
use pipeline_orchestrator::models::execution::{ExecutionMode, ExecutionStatus};
use pipeline_orchestrator::models::phase::{PhaseName, PhaseState};
use pipeline_orchestrator::orchestrator::ResumeReason;

use super::test_helpers::{
    complete_phase, detached_execution, pipeline, seed_content, seed_results, settle, test_app,
    FakeProviders,
};

/// Executions updated within the stale threshold are never touched, even
/// with collection running.
#[tokio::test]
async fn recent_executions_are_left_alone() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let execution = detached_execution(&app, pipeline("rust")).await;
    app.store
        .phases
        .transition(
            &execution.id,
            PhaseName::ResultCollection,
            &[PhaseState::Pending],
            PhaseState::Running,
            Utc::now(),
        )
        .await
        .expect("collection running");

    let outcomes = app
        .resumption
        .scan_once(Utc::now() + Duration::minutes(2))
        .await
        .expect("scan");

    assert!(outcomes.is_empty());
    assert!(!app.orchestrator.is_attached(&execution.id).await);
}

/// An interrupted collection is relaunched.
#[tokio::test]
async fn running_collection_is_relaunched() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let execution = detached_execution(&app, pipeline("rust")).await;
    complete_phase(&app, &execution.id, PhaseName::Metrics).await;
    app.store
        .phases
        .transition(
            &execution.id,
            PhaseName::ResultCollection,
            &[PhaseState::Pending],
            PhaseState::Running,
            Utc::now(),
        )
        .await
        .expect("collection running");

    let outcomes = app
        .resumption
        .scan_once(Utc::now() + Duration::minutes(6))
        .await
        .expect("scan");

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].reason, Some(ResumeReason::RelaunchCollection));
    assert!(outcomes[0].resumed);
    let settled = settle(&app, &execution.id).await;
    assert_eq!(settled.status, ExecutionStatus::Completed);
    assert_eq!(fakes.metrics_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fakes.collect_calls.load(Ordering::SeqCst), 1);
}

/// Collected but unscraped results resume scraping without repeating the
/// earlier phases.
#[tokio::test]
async fn unscraped_results_resume_scraping() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let execution = detached_execution(&app, pipeline("rust")).await;
    complete_phase(&app, &execution.id, PhaseName::Metrics).await;
    complete_phase(&app, &execution.id, PhaseName::ResultCollection).await;
    seed_results(&app, &execution.id, 4).await;

    let outcomes = app
        .resumption
        .scan_once(Utc::now() + Duration::minutes(6))
        .await
        .expect("scan");

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].reason, Some(ResumeReason::ResumeScraping));
    let settled = settle(&app, &execution.id).await;
    assert_eq!(settled.status, ExecutionStatus::Completed);
    assert_eq!(fakes.metrics_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fakes.collect_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fakes.fetch_calls.load(Ordering::SeqCst), 4);
    assert_eq!(app.store.content.count_analyses(&execution.id).await.expect("count"), 4);
}

/// Scraped but unanalyzed content resumes analysis.
#[tokio::test]
async fn unanalyzed_content_resumes_analysis() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let execution = detached_execution(&app, pipeline("rust")).await;
    for phase in [
        PhaseName::Metrics,
        PhaseName::ResultCollection,
        PhaseName::CompanyEnrichment,
        PhaseName::VideoEnrichment,
        PhaseName::ContentScraping,
    ] {
        complete_phase(&app, &execution.id, phase).await;
    }
    let urls = seed_results(&app, &execution.id, 2).await;
    seed_content(&app, &execution.id, &urls, 300).await;

    let outcomes = app
        .resumption
        .scan_once(Utc::now() + Duration::minutes(6))
        .await
        .expect("scan");

    assert_eq!(outcomes[0].reason, Some(ResumeReason::ResumeAnalysis));
    let settled = settle(&app, &execution.id).await;
    assert_eq!(settled.status, ExecutionStatus::Completed);
    assert_eq!(fakes.fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fakes.analyze_calls.load(Ordering::SeqCst), 2);
}

/// Stale but not yet idle executions with nothing pending are inspected
/// and left for a later scan; idle ones get a generic resume.
#[tokio::test]
async fn idle_threshold_gates_generic_resume() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let execution = detached_execution(&app, pipeline("rust")).await;

    let stale = app
        .resumption
        .scan_once(Utc::now() + Duration::minutes(6))
        .await
        .expect("scan");
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].reason, None);
    assert!(!stale[0].resumed);

    let idle = app
        .resumption
        .scan_once(Utc::now() + Duration::minutes(11))
        .await
        .expect("scan");
    assert_eq!(idle[0].reason, Some(ResumeReason::GenericResume));
    assert!(idle[0].resumed);
    assert_eq!(settle(&app, &execution.id).await.status, ExecutionStatus::Completed);
}

/// Executions this process is already driving are skipped.
#[tokio::test]
async fn attached_executions_are_skipped() {
    let (fakes, gate) = FakeProviders::blocking_collection();
    let fakes = Arc::new(fakes);
    let app = test_app(&fakes).await;
    let id = app
        .orchestrator
        .start(pipeline("rust"), ExecutionMode::Manual)
        .await
        .expect("start");

    let outcomes = app
        .resumption
        .scan_once(Utc::now() + Duration::minutes(30))
        .await
        .expect("scan");
    assert!(outcomes.is_empty());

    gate.add_permits(4);
    settle(&app, &id).await;
}
