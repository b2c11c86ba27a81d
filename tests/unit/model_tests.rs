//! Domain model behaviour: phase lifecycle, pipeline scope, schedules and
//! primary-dimension selection.

use chrono::{Duration, TimeZone, Utc};
use pipeline_orchestrator::models::execution::{ExecutionMode, ExecutionStatus};
use pipeline_orchestrator::models::phase::{PhaseName, PhaseState};
use pipeline_orchestrator::models::pipeline::{
    ContentType, PipelineConfig, PipelineConfigOverride,
};
use pipeline_orchestrator::models::schedule::{
    ContentSchedule, NewSchedule, Recurrence, ScheduleUpdate,
};
use pipeline_orchestrator::models::work_item::{
    validate_dimensions, AnalysisDimension, DimensionScores, PrimaryDimensionPolicy,
};
use pipeline_orchestrator::AppError;

fn dimension(name: &str) -> AnalysisDimension {
    AnalysisDimension {
        name: name.into(),
        criteria: vec![format!("{name} criteria")],
    }
}

fn scope() -> PipelineConfig {
    PipelineConfig {
        keywords: vec!["rust".into(), "go".into(), "zig".into()],
        regions: vec!["us".into(), "uk".into(), "de".into()],
        ..PipelineConfig::default()
    }
}

// ── Phase lifecycle ──────────────────────────────────

#[test]
fn phase_lifecycle_edges() {
    use PhaseState::{Blocked, Completed, Failed, Pending, Running};

    assert!(Pending.can_transition_to(Running));
    for end in [Completed, Failed, Blocked] {
        assert!(Running.can_transition_to(end));
        assert!(!Pending.can_transition_to(end));
        assert!(!end.can_transition_to(Running));
        assert!(!end.can_transition_to(Pending));
    }
    assert!(!Running.can_transition_to(Pending));
}

#[test]
fn phase_names_parse_and_order() {
    for phase in PhaseName::ORDER {
        assert_eq!(phase.as_str().parse::<PhaseName>().expect("parse"), phase);
    }
    assert!("indexing".parse::<PhaseName>().is_err());
    assert!(PhaseName::Metrics < PhaseName::Snapshot);
    assert!(PhaseName::ResultCollection.is_critical());
    assert!(!PhaseName::Scoring.is_critical());
}

#[test]
fn execution_status_round_trips() {
    for status in [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
        ExecutionStatus::Partial,
    ] {
        assert_eq!(status.as_str().parse::<ExecutionStatus>().expect("parse"), status);
    }
    assert!(ExecutionStatus::Partial.is_settled());
    assert!(!ExecutionStatus::Running.is_settled());
    assert_eq!(
        "scheduled".parse::<ExecutionMode>().expect("mode"),
        ExecutionMode::Scheduled
    );
}

// ── Pipeline scope ───────────────────────────────────

#[test]
fn video_enrichment_requires_video_results() {
    let mut config = scope();
    assert!(!config.phase_enabled(PhaseName::VideoEnrichment));
    config.content_types.push(ContentType::Video);
    assert!(config.phase_enabled(PhaseName::VideoEnrichment));
    config.enable_video_enrichment = false;
    assert!(!config.phase_enabled(PhaseName::VideoEnrichment));
}

#[test]
fn collection_and_snapshot_always_run() {
    let config = PipelineConfig {
        enable_metrics: false,
        enable_scoring: false,
        ..scope()
    };
    assert!(!config.phase_enabled(PhaseName::Metrics));
    assert!(!config.phase_enabled(PhaseName::Scoring));
    assert!(config.phase_enabled(PhaseName::ResultCollection));
    assert!(config.phase_enabled(PhaseName::Snapshot));
}

#[test]
fn testing_mode_shrinks_scope() {
    let mut config = scope();
    assert_eq!(config.effective_keywords().len(), 3);

    config.testing_mode = true;
    config.testing_batch_size = 2;
    assert_eq!(config.effective_keywords(), &["rust".to_owned(), "go".to_owned()]);
    assert_eq!(config.effective_regions().len(), 2);
    assert!(!config.skip_delays());

    config.testing_skip_delays = true;
    assert!(config.skip_delays());
}

#[test]
fn validate_requires_scope_unless_reusing_results() {
    assert!(scope().validate().is_ok());

    let empty = PipelineConfig::default();
    assert!(matches!(empty.validate(), Err(AppError::Config(_))));

    let reuse = PipelineConfig {
        reuse_results_from_execution_id: Some("earlier".into()),
        ..PipelineConfig::default()
    };
    assert!(reuse.validate().is_ok());

    let zero = PipelineConfig {
        max_concurrent_scraping: 0,
        ..scope()
    };
    assert!(zero.validate().is_err());
}

#[test]
fn override_only_touches_phases_not_started() {
    let mut config = scope();
    let patch = PipelineConfigOverride {
        max_concurrent_collection: Some(1),
        max_concurrent_scraping: Some(9),
        analysis_dimensions: Some(vec![dimension("depth")]),
        force_refresh: Some(true),
        ..PipelineConfigOverride::default()
    };

    config.apply_override(
        &patch,
        &[PhaseName::ContentScraping, PhaseName::ContentAnalysis],
    );

    assert_eq!(config.max_concurrent_collection, 5);
    assert_eq!(config.max_concurrent_scraping, 9);
    assert_eq!(config.analysis_dimensions, vec![dimension("depth")]);
    assert!(config.force_refresh);
}

// ── Dimensions ───────────────────────────────────────

#[test]
fn dimensions_need_names_and_criteria() {
    assert!(validate_dimensions(&[]).is_err());
    assert!(validate_dimensions(&[dimension("depth")]).is_ok());
    let blank = AnalysisDimension {
        name: "tone".into(),
        criteria: vec!["  ".into()],
    };
    assert!(validate_dimensions(&[blank]).is_err());
}

#[test]
fn primary_dimension_policies() {
    let dims = [dimension("relevance"), dimension("depth"), dimension("tone")];
    let scores = DimensionScores {
        scores: [("depth".to_owned(), 0.9), ("tone".to_owned(), 0.9)]
            .into_iter()
            .collect(),
    };

    assert_eq!(
        PrimaryDimensionPolicy::HighestScore.select(&dims, &scores),
        Some("depth".into())
    );
    assert_eq!(
        PrimaryDimensionPolicy::FirstConfigured.select(&dims, &scores),
        Some("depth".into())
    );
    assert_eq!(
        PrimaryDimensionPolicy::HighestScore.select(&dims, &DimensionScores::default()),
        None
    );
}

#[test]
fn non_finite_scores_never_become_primary() {
    let dims = [dimension("relevance"), dimension("depth"), dimension("tone")];
    let scores = DimensionScores {
        scores: [
            ("relevance".to_owned(), f64::NAN),
            ("depth".to_owned(), 0.4),
            ("tone".to_owned(), f64::NAN),
        ]
        .into_iter()
        .collect(),
    };

    assert_eq!(
        PrimaryDimensionPolicy::HighestScore.select(&dims, &scores),
        Some("depth".into())
    );
    assert_eq!(
        PrimaryDimensionPolicy::FirstConfigured.select(&dims, &scores),
        Some("depth".into())
    );

    let only_infinite = DimensionScores {
        scores: [("tone".to_owned(), f64::INFINITY)].into_iter().collect(),
    };
    assert_eq!(PrimaryDimensionPolicy::HighestScore.select(&dims, &only_infinite), None);
}

// ── Schedules ────────────────────────────────────────

fn daily(content_type: ContentType, hour: u32) -> ContentSchedule {
    ContentSchedule {
        content_type,
        recurrence: Recurrence::Daily { hour, minute: 0 },
        timeout_hours: 2.0,
        next_run_at: None,
    }
}

fn new_schedule(rules: Vec<ContentSchedule>) -> NewSchedule {
    NewSchedule {
        name: "nightly".into(),
        content_schedules: rules,
        keywords: vec!["rust".into()],
        regions: vec!["us".into()],
        max_concurrent_executions: 1,
        template: PipelineConfig::default(),
    }
}

#[test]
fn new_schedule_seeds_due_times() {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).single().expect("time");
    let schedule = new_schedule(vec![daily(ContentType::Organic, 2), daily(ContentType::News, 5)])
        .into_schedule(now)
        .expect("valid schedule");

    let news_due = Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).single().expect("time");
    assert_eq!(schedule.next_execution_at, Some(news_due));
    assert_eq!(schedule.due_content_types(news_due), vec![ContentType::News]);
    assert_eq!(
        schedule.due_content_types(now + Duration::days(1)),
        vec![ContentType::Organic, ContentType::News]
    );
    assert!(schedule.active);
}

#[test]
fn launch_config_carries_filters_and_schedule_id() {
    let now = Utc::now();
    let schedule = new_schedule(vec![daily(ContentType::Organic, 2), daily(ContentType::Video, 4)])
        .into_schedule(now)
        .expect("valid schedule");

    let launch = schedule.launch_config(&[ContentType::Video]);
    assert_eq!(launch.keywords, vec!["rust".to_owned()]);
    assert_eq!(launch.content_types, vec![ContentType::Video]);
    assert_eq!(launch.schedule_id.as_deref(), Some(schedule.id.as_str()));
    assert!((schedule.timeout_hours_for(&[ContentType::Video]) - 2.0).abs() < f64::EPSILON);
}

#[test]
fn invalid_new_schedules_are_rejected() {
    let now = Utc::now();
    let duplicate = new_schedule(vec![daily(ContentType::Organic, 2), daily(ContentType::Organic, 3)]);
    let bad_hour = new_schedule(vec![daily(ContentType::Organic, 24)]);
    let no_rules = new_schedule(Vec::new());
    let mut no_timeout = new_schedule(vec![daily(ContentType::Organic, 2)]);
    no_timeout.content_schedules[0].timeout_hours = 0.0;
    let mut bad_day = new_schedule(vec![daily(ContentType::Organic, 2)]);
    bad_day.content_schedules[0].recurrence = Recurrence::Monthly {
        day: 0,
        hour: 1,
        minute: 0,
    };

    for candidate in [duplicate, bad_hour, no_rules, no_timeout, bad_day] {
        assert!(matches!(
            candidate.into_schedule(now),
            Err(AppError::Config(_))
        ));
    }
}

#[test]
fn rejected_update_leaves_schedule_untouched() {
    let now = Utc::now();
    let mut schedule = new_schedule(vec![daily(ContentType::Organic, 2)])
        .into_schedule(now)
        .expect("valid schedule");
    let before = schedule.clone();

    let update = ScheduleUpdate {
        name: Some("renamed".into()),
        max_concurrent_executions: Some(0),
        ..ScheduleUpdate::default()
    };
    assert!(update.apply(&mut schedule, now).is_err());
    assert_eq!(schedule, before);
}

#[test]
fn update_with_new_rules_recomputes_due_times() {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).single().expect("time");
    let mut schedule = new_schedule(vec![daily(ContentType::Organic, 2)])
        .into_schedule(now)
        .expect("valid schedule");

    let update = ScheduleUpdate {
        content_schedules: Some(vec![daily(ContentType::Organic, 4)]),
        active: Some(false),
        ..ScheduleUpdate::default()
    };
    update.apply(&mut schedule, now).expect("valid update");

    assert!(!schedule.active);
    assert_eq!(
        schedule.next_execution_at,
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).single().expect("time"))
    );
}
