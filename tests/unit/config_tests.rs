use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use pipeline_orchestrator::models::phase::PhaseName;
use pipeline_orchestrator::{AppError, GlobalConfig};

fn sample_toml() -> &'static str {
    r#"
db_path = "state/pipeline.db"
retention_days = 30

[concurrency]
global_limit = 20
batch_size = 4
min_content_length = 150
monitor_tick_ms = 250

[health]
interval_seconds = 30
max_runtime_hours = 12

[health.phase_timeouts_minutes]
content_analysis = 15

[circuit_breaker]
failure_threshold = 3
open_seconds = 10

[retry]
max_attempts = 5

[providers]
scorer_url = "http://localhost:9000"
"#
}

#[test]
fn empty_file_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("defaults");
    assert_eq!(config, GlobalConfig::default());
    assert_eq!(config.db_path, PathBuf::from("data/pipeline.db"));
    assert_eq!(config.retention_days, 90);
    assert_eq!(config.concurrency.global_limit, 50);
    assert_eq!(config.max_concurrent_batches(), 5);
}

#[test]
fn sample_config_parses_sections() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(config.db_path, PathBuf::from("state/pipeline.db"));
    assert_eq!(config.retention_days, 30);
    assert_eq!(config.concurrency.batch_size, 4);
    assert_eq!(config.max_concurrent_batches(), 5);
    assert_eq!(config.monitor_tick(), Duration::from_millis(250));
    assert_eq!(config.health.max_runtime_hours, 12);
    assert_eq!(config.circuit_breaker.failure_threshold, 3);
    assert_eq!(config.retry.max_attempts, 5);
    // Unset fields in a present section keep their defaults.
    assert_eq!(config.retry.base_delay_ms, 500);
    assert_eq!(
        config.providers.scorer_url.as_deref(),
        Some("http://localhost:9000")
    );
    assert!(config.providers.analyzer_url.is_none());
}

#[test]
fn phase_timeout_overrides_fall_back_to_defaults() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(
        config.health.phase_timeout(PhaseName::ContentAnalysis),
        chrono::Duration::minutes(15)
    );
    assert_eq!(
        config.health.phase_timeout(PhaseName::ContentScraping),
        chrono::Duration::minutes(180)
    );
    assert_eq!(
        config.health.phase_timeout(PhaseName::Metrics),
        chrono::Duration::minutes(30)
    );
}

#[test]
fn batches_never_drop_below_one() {
    let config = GlobalConfig::from_toml_str(
        "[concurrency]\nglobal_limit = 3\nbatch_size = 10\n",
    )
    .expect("valid config");
    assert_eq!(config.max_concurrent_batches(), 1);
}

#[test]
fn invalid_values_are_rejected() {
    let cases = [
        "[concurrency]\nglobal_limit = 0\n",
        "[concurrency]\nbatch_size = 0\n",
        "[circuit_breaker]\nfailure_threshold = 0\n",
        "[retry]\nmax_attempts = 0\n",
        "[resumption]\nstale_minutes = 20\nidle_minutes = 10\n",
        "[health]\ninterval_seconds = 0\n",
    ];
    for raw in cases {
        let err = GlobalConfig::from_toml_str(raw).expect_err(raw);
        assert!(matches!(err, AppError::Config(_)), "{raw}: {err}");
    }
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = GlobalConfig::from_toml_str("retention_days = \"soon\"").expect_err("bad type");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn unknown_phase_in_timeout_table_is_rejected() {
    let raw = "[health.phase_timeouts_minutes]\nindexing = 5\n";
    assert!(GlobalConfig::from_toml_str(raw).is_err());
}

#[test]
fn load_from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write");

    let config = GlobalConfig::load_from_path(file.path()).expect("load");
    assert_eq!(config.retention_days, 30);
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = GlobalConfig::load_from_path(dir.path().join("absent.toml")).expect_err("missing");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn oversized_time_spans_are_rejected() {
    let cases = [
        "[health]\nmax_runtime_hours = 10000000000000\n",
        "[health]\nalert_retention_hours = 18446744073709551615\n",
        "[health.phase_timeouts_minutes]\nscoring = 9223372036854775807\n",
        "retention_days = 4000000000\n",
        "[resumption]\nstale_minutes = -1\n",
        "[orchestrator]\nduplicate_window_seconds = -5\n",
    ];
    for raw in cases {
        let err = GlobalConfig::from_toml_str(raw).expect_err(raw);
        assert!(matches!(err, AppError::Config(_)), "{raw}: {err}");
    }
}

#[test]
fn span_helpers_clamp_instead_of_overflowing() {
    use pipeline_orchestrator::config::{span_days, span_hours, span_minutes, MAX_SPAN_MINUTES};

    let max = chrono::Duration::minutes(MAX_SPAN_MINUTES);
    assert_eq!(span_hours(10_000_000_000_000), max);
    assert_eq!(span_days(u64::MAX), max);
    assert_eq!(span_minutes(-3), chrono::Duration::zero());
    assert_eq!(span_hours(2), chrono::Duration::hours(2));
    assert!(chrono::Utc::now().checked_sub_signed(max).is_some());
}
