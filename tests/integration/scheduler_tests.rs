//! Tests for schedule management, scheduled launches and launch timeouts.

use std::sync::Arc;

use chrono::{Duration, Weekday};
use pipeline_orchestrator::models::execution::{ExecutionMode, ExecutionStatus};
use pipeline_orchestrator::models::pipeline::{ContentType, PipelineConfig};
use pipeline_orchestrator::models::schedule::{
    ContentSchedule, NewSchedule, Recurrence, ScheduleRunStatus, ScheduleUpdate,
};
use pipeline_orchestrator::AppError;

use super::test_helpers::{dimensions, status_of, test_app, FakeProviders};

fn daily(content_type: ContentType, timeout_hours: f64) -> ContentSchedule {
    ContentSchedule {
        content_type,
        recurrence: Recurrence::Daily { hour: 2, minute: 0 },
        timeout_hours,
        next_run_at: None,
    }
}

fn new_schedule(rules: Vec<ContentSchedule>, cap: u32) -> NewSchedule {
    NewSchedule {
        name: "nightly".into(),
        content_schedules: rules,
        keywords: vec!["rust".into()],
        regions: vec!["us".into()],
        max_concurrent_executions: cap,
        template: PipelineConfig {
            analysis_dimensions: dimensions(),
            ..PipelineConfig::default()
        },
    }
}

/// A due schedule launches one execution, advances its due time, and
/// records the outcome once the execution completes.
#[tokio::test]
async fn due_schedule_launches_and_records_outcome() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let schedule = app
        .scheduler
        .create_schedule(new_schedule(vec![daily(ContentType::Organic, 1.0)], 1))
        .await
        .expect("create");
    let due = schedule.next_execution_at.expect("seeded");

    let now = due + Duration::minutes(1);
    let launches = app.scheduler.tick(now).await.expect("tick");
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].content_types, vec![ContentType::Organic]);

    let execution = app
        .store
        .executions
        .require(&launches[0].execution_id)
        .await
        .expect("execution");
    assert_eq!(execution.mode, ExecutionMode::Scheduled);
    assert_eq!(execution.config.schedule_id.as_deref(), Some(schedule.id.as_str()));

    let stored = app.store.schedules.get(&schedule.id).await.expect("schedule");
    assert!(stored.next_execution_at.expect("next") > now);
    assert_eq!(stored.last_executed_at, Some(now));
    assert!(app.scheduler.tick(now).await.expect("tick again").is_empty());

    app.scheduler.drain_waiters().await;
    let runs = app.store.schedules.list_runs(&schedule.id).await.expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, ScheduleRunStatus::Completed);
    assert!(runs[0].finished_at.is_some());
}

/// Only the due sub-types are launched; the others keep their due time.
#[tokio::test]
async fn launch_covers_only_due_content_types() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let weekly_video = ContentSchedule {
        content_type: ContentType::Video,
        recurrence: Recurrence::Weekly {
            weekday: Weekday::Sun,
            hour: 3,
            minute: 0,
        },
        timeout_hours: 1.0,
        next_run_at: None,
    };
    let mut schedule = app
        .scheduler
        .create_schedule(new_schedule(
            vec![daily(ContentType::Organic, 1.0), weekly_video],
            2,
        ))
        .await
        .expect("create");
    let organic_due = schedule.content_schedules[0].next_run_at.expect("organic");
    let video_due = organic_due + Duration::days(30);
    schedule.content_schedules[1].next_run_at = Some(video_due);
    app.store.schedules.save(&schedule).await.expect("save");

    let launches = app
        .scheduler
        .tick(organic_due + Duration::minutes(1))
        .await
        .expect("tick");
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].content_types, vec![ContentType::Organic]);

    let stored = app.store.schedules.get(&schedule.id).await.expect("schedule");
    assert!(stored.content_schedules[0].next_run_at.expect("organic") > organic_due);
    assert_eq!(stored.content_schedules[1].next_run_at, Some(video_due));
    app.scheduler.drain_waiters().await;
}

/// A schedule at its concurrency cap does not launch again.
#[tokio::test]
async fn concurrency_cap_is_respected() {
    let (fakes, gate) = FakeProviders::blocking_collection();
    let fakes = Arc::new(fakes);
    let app = test_app(&fakes).await;
    let schedule = app
        .scheduler
        .create_schedule(new_schedule(vec![daily(ContentType::Organic, 1.0)], 1))
        .await
        .expect("create");
    let due = schedule.next_execution_at.expect("seeded");

    let first = app
        .scheduler
        .tick(due + Duration::minutes(1))
        .await
        .expect("tick");
    assert_eq!(first.len(), 1);

    let blocked = app
        .scheduler
        .tick(due + Duration::days(2))
        .await
        .expect("tick at cap");
    assert!(blocked.is_empty());
    assert_eq!(
        app.store
            .schedules
            .count_active_executions(&schedule.id)
            .await
            .expect("count"),
        1
    );

    gate.add_permits(8);
    app.scheduler.drain_waiters().await;
}

/// A launch that outlives its timeout is cancelled and recorded as timed out.
#[tokio::test]
async fn timed_out_launch_is_cancelled() {
    let (fakes, _gate) = FakeProviders::blocking_collection();
    let fakes = Arc::new(fakes);
    let app = test_app(&fakes).await;
    // About a third of a second.
    let schedule = app
        .scheduler
        .create_schedule(new_schedule(vec![daily(ContentType::Organic, 0.0001)], 1))
        .await
        .expect("create");
    let due = schedule.next_execution_at.expect("seeded");

    let launches = app
        .scheduler
        .tick(due + Duration::minutes(1))
        .await
        .expect("tick");
    app.scheduler.drain_waiters().await;

    let runs = app.store.schedules.list_runs(&schedule.id).await.expect("runs");
    assert_eq!(runs[0].status, ScheduleRunStatus::TimedOut);
    assert_eq!(
        status_of(&app, &launches[0].execution_id).await,
        ExecutionStatus::Cancelled
    );
}

/// Inactive schedules are never launched.
#[tokio::test]
async fn inactive_schedule_is_skipped() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let schedule = app
        .scheduler
        .create_schedule(new_schedule(vec![daily(ContentType::Organic, 1.0)], 1))
        .await
        .expect("create");
    app.scheduler
        .update_schedule(
            &schedule.id,
            ScheduleUpdate {
                active: Some(false),
                ..ScheduleUpdate::default()
            },
        )
        .await
        .expect("deactivate");

    let due = schedule.next_execution_at.expect("seeded");
    assert!(app
        .scheduler
        .tick(due + Duration::minutes(1))
        .await
        .expect("tick")
        .is_empty());
}

/// Invalid input is rejected on create and update; a rejected update
/// leaves the stored schedule unchanged.
#[tokio::test]
async fn invalid_schedule_input_is_rejected() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;

    let mut bad_cron = new_schedule(vec![daily(ContentType::Organic, 1.0)], 1);
    bad_cron.content_schedules[0].recurrence = Recurrence::Cron {
        expression: "61 * * * *".into(),
    };
    assert!(matches!(
        app.scheduler.create_schedule(bad_cron).await,
        Err(AppError::Config(_))
    ));

    let schedule = app
        .scheduler
        .create_schedule(new_schedule(vec![daily(ContentType::Organic, 1.0)], 1))
        .await
        .expect("create");
    let update = ScheduleUpdate {
        name: Some("renamed".into()),
        regions: Some(Vec::new()),
        ..ScheduleUpdate::default()
    };
    assert!(matches!(
        app.scheduler.update_schedule(&schedule.id, update).await,
        Err(AppError::Config(_))
    ));
    let stored = app.store.schedules.get(&schedule.id).await.expect("schedule");
    assert_eq!(stored.name, "nightly");
    assert_eq!(stored.regions, vec!["us".to_owned()]);
}

/// Deleting a schedule removes it.
#[tokio::test]
async fn deleted_schedule_is_gone() {
    let fakes = Arc::new(FakeProviders::default());
    let app = test_app(&fakes).await;
    let schedule = app
        .scheduler
        .create_schedule(new_schedule(vec![daily(ContentType::Organic, 1.0)], 1))
        .await
        .expect("create");

    app.scheduler.delete_schedule(&schedule.id).await.expect("delete");

    assert!(matches!(
        app.store.schedules.get(&schedule.id).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        app.scheduler.delete_schedule(&schedule.id).await,
        Err(AppError::NotFound(_))
    ));
}
