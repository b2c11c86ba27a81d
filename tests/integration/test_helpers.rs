//! Shared fakes and builders for integration tests.
//!
//! [`FakeProviders`] implements every collaborator trait in memory so an
//! execution can run end to end against an in-memory `SQLite` database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use pipeline_orchestrator::app::AppState;
use pipeline_orchestrator::collaborators::{
    CollectQuery, Collaborators, Content, ContentAnalyzer, ContentFetcher, Enricher,
    KeywordMetrics, KeywordMetricsProvider, MetricsQuery, Profile, ResultCollector,
    ScoreCalculator, Score, SearchResult,
};
use pipeline_orchestrator::config::GlobalConfig;
use pipeline_orchestrator::models::execution::{Execution, ExecutionMode, ExecutionStatus};
use pipeline_orchestrator::models::phase::{PhaseName, PhaseState};
use pipeline_orchestrator::models::pipeline::{ContentType, PipelineConfig};
use pipeline_orchestrator::models::work_item::{AnalysisDimension, DimensionScores};
use pipeline_orchestrator::persistence::db;
use pipeline_orchestrator::{AppError, Result};
use tokio::sync::Semaphore;

/// In-memory implementation of every collaborator.
pub struct FakeProviders {
    /// Results returned per collect call.
    pub results_per_query: usize,
    /// Characters in every fetched body.
    pub body_length: usize,
    /// URLs the analyzer fails on.
    pub analyzer_failures: Mutex<HashSet<String>>,
    /// Error returned by every collect call, when set.
    pub collect_error: Mutex<Option<AppError>>,
    /// Error returned by the scorer, when set.
    pub score_error: Mutex<Option<AppError>>,
    /// When set, collect calls wait for a permit that is never returned.
    pub collect_gate: Option<Arc<Semaphore>>,
    /// Delay inside every analyzer call.
    pub analyzer_delay: Duration,
    /// Metrics calls made.
    pub metrics_calls: AtomicUsize,
    /// Collect calls made.
    pub collect_calls: AtomicUsize,
    /// Fetch calls made.
    pub fetch_calls: AtomicUsize,
    /// Analyzer calls made.
    pub analyze_calls: AtomicUsize,
    /// Analyzer calls currently running.
    pub analyzing_now: AtomicUsize,
    /// Highest observed analyzer concurrency.
    pub analyzing_peak: AtomicUsize,
}

impl Default for FakeProviders {
    fn default() -> Self {
        Self {
            results_per_query: 3,
            body_length: 500,
            analyzer_failures: Mutex::new(HashSet::new()),
            collect_error: Mutex::new(None),
            score_error: Mutex::new(None),
            collect_gate: None,
            analyzer_delay: Duration::ZERO,
            metrics_calls: AtomicUsize::new(0),
            collect_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            analyze_calls: AtomicUsize::new(0),
            analyzing_now: AtomicUsize::new(0),
            analyzing_peak: AtomicUsize::new(0),
        }
    }
}

impl FakeProviders {
    /// Fakes whose collect calls block until the gate gets permits.
    pub fn blocking_collection() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fakes = Self {
            collect_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (fakes, gate)
    }

    /// Share the fakes as a full collaborator set.
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            metrics: Arc::clone(self) as Arc<dyn KeywordMetricsProvider>,
            collector: Arc::clone(self) as Arc<dyn ResultCollector>,
            fetcher: Arc::clone(self) as Arc<dyn ContentFetcher>,
            company: Arc::clone(self) as Arc<dyn Enricher>,
            video: Arc::clone(self) as Arc<dyn Enricher>,
            analyzer: Arc::clone(self) as Arc<dyn ContentAnalyzer>,
            scorer: Arc::clone(self) as Arc<dyn ScoreCalculator>,
        }
    }

    /// Make the analyzer fail on `url`.
    pub fn fail_analysis_of(&self, url: &str) {
        self.analyzer_failures
            .lock()
            .unwrap()
            .insert(url.to_owned());
    }
}

impl KeywordMetricsProvider for FakeProviders {
    fn metrics<'a>(&'a self, _query: &'a MetricsQuery) -> BoxFuture<'a, Result<KeywordMetrics>> {
        Box::pin(async move {
            self.metrics_calls.fetch_add(1, Ordering::SeqCst);
            Ok(KeywordMetrics {
                search_volume: Some(1_000),
                difficulty: Some(42.0),
            })
        })
    }
}

impl ResultCollector for FakeProviders {
    fn collect<'a>(&'a self, query: &'a CollectQuery) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
        Box::pin(async move {
            self.collect_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.collect_gate {
                gate.acquire().await.unwrap().forget();
            }
            if let Some(err) = self.collect_error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok((1..=self.results_per_query)
                .map(|position| SearchResult {
                    keyword: query.keyword.clone(),
                    region: query.region.clone(),
                    content_type: query.content_type,
                    url: format!(
                        "https://site{position}.example/{}/{}",
                        query.keyword, query.region
                    ),
                    domain: format!("site{position}.example"),
                    position: i64::try_from(position).unwrap(),
                    title: Some(format!("result {position}")),
                })
                .collect())
        })
    }
}

impl ContentFetcher for FakeProviders {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Content>> {
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Content {
                url: url.to_owned(),
                body: "x".repeat(self.body_length),
            })
        })
    }
}

impl Enricher for FakeProviders {
    fn enrich<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Option<Profile>>> {
        Box::pin(async move { Ok(Some(serde_json::json!({ "name": target }))) })
    }
}

impl ContentAnalyzer for FakeProviders {
    fn analyze<'a>(
        &'a self,
        url: &'a str,
        _content: &'a str,
        _metadata: &'a serde_json::Value,
        dimensions: &'a [AnalysisDimension],
    ) -> BoxFuture<'a, Result<DimensionScores>> {
        Box::pin(async move {
            self.analyze_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.analyzing_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.analyzing_peak.fetch_max(now, Ordering::SeqCst);
            if !self.analyzer_delay.is_zero() {
                tokio::time::sleep(self.analyzer_delay).await;
            }
            self.analyzing_now.fetch_sub(1, Ordering::SeqCst);

            if self.analyzer_failures.lock().unwrap().contains(url) {
                return Err(AppError::Permanent(format!("cannot analyze {url}")));
            }
            let mut scores = DimensionScores::default();
            for (idx, dimension) in dimensions.iter().enumerate() {
                scores
                    .scores
                    .insert(dimension.name.clone(), f64::from(u32::try_from(idx).unwrap()) + 0.5);
            }
            Ok(scores)
        })
    }
}

impl ScoreCalculator for FakeProviders {
    fn compute<'a>(&'a self, _execution_id: &'a str) -> BoxFuture<'a, Result<Score>> {
        Box::pin(async move {
            if let Some(err) = self.score_error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(Score {
                value: 87.5,
                components: serde_json::json!({ "coverage": 1.0 }),
            })
        })
    }
}

/// Global configuration with short ticks for tests.
pub fn test_config() -> GlobalConfig {
    GlobalConfig::from_toml_str(
        r#"
db_path = ":memory:"

[concurrency]
global_limit = 4
batch_size = 2
min_content_length = 100
monitor_tick_ms = 20

[retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 5

[orchestrator]
duplicate_window_seconds = 15
completion_poll_ms = 20
"#,
    )
    .expect("valid test config")
}

/// Dimensions used by every test pipeline.
pub fn dimensions() -> Vec<AnalysisDimension> {
    vec![
        AnalysisDimension {
            name: "relevance".into(),
            criteria: vec!["matches the keyword".into()],
        },
        AnalysisDimension {
            name: "depth".into(),
            criteria: vec!["covers the topic thoroughly".into()],
        },
    ]
}

/// A small pipeline: one keyword, one region, organic results only.
pub fn pipeline(keyword: &str) -> PipelineConfig {
    PipelineConfig {
        keywords: vec![keyword.to_owned()],
        regions: vec!["us".into()],
        analysis_dimensions: dimensions(),
        ..PipelineConfig::default()
    }
}

/// Wire an `AppState` over a fresh in-memory database.
pub async fn test_app(fakes: &Arc<FakeProviders>) -> AppState {
    let db = Arc::new(db::connect_memory().await.expect("in-memory db"));
    AppState::build(test_config(), db, &fakes.collaborators())
}

/// Wait until the execution settles, failing the test after five seconds.
pub async fn settle(app: &AppState, execution_id: &str) -> Execution {
    app.orchestrator
        .wait_for_completion(execution_id, Duration::from_secs(5))
        .await
        .expect("wait")
        .expect("execution settled in time")
}

/// Poll until `check` holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

/// Status of an execution straight from the store.
pub async fn status_of(app: &AppState, execution_id: &str) -> ExecutionStatus {
    app.store
        .executions
        .require(execution_id)
        .await
        .expect("execution")
        .status
}

/// Persist a `running` execution with pending phases and no driver.
pub async fn detached_execution(app: &AppState, config: PipelineConfig) -> Execution {
    let execution = app
        .store
        .executions
        .create(&Execution::new(config, ExecutionMode::Manual))
        .await
        .expect("create execution");
    app.store
        .phases
        .initialize(&execution.id, &PhaseName::ORDER)
        .await
        .expect("initialize phases");
    app.store
        .executions
        .transition_status(&execution.id, &[ExecutionStatus::Pending], ExecutionStatus::Running)
        .await
        .expect("running")
}

/// Insert `count` results for the execution and return their URLs.
pub async fn seed_results(app: &AppState, execution_id: &str, count: usize) -> Vec<String> {
    let results: Vec<SearchResult> = (1..=count)
        .map(|position| SearchResult {
            keyword: "rust".into(),
            region: "us".into(),
            content_type: ContentType::Organic,
            url: format!("https://seed{position:02}.example/page"),
            domain: format!("seed{position:02}.example"),
            position: i64::try_from(position).unwrap(),
            title: None,
        })
        .collect();
    app.store
        .content
        .insert_results(execution_id, &results)
        .await
        .expect("insert results");
    results.into_iter().map(|r| r.url).collect()
}

/// Store a fetched body of `length` characters for every URL.
pub async fn seed_content(app: &AppState, execution_id: &str, urls: &[String], length: usize) {
    for url in urls {
        app.store
            .content
            .record_content(execution_id, url, &"y".repeat(length))
            .await
            .expect("record content");
    }
}

/// Mark a phase completed without running it.
pub async fn complete_phase(app: &AppState, execution_id: &str, phase: PhaseName) {
    let now = Utc::now();
    app.store
        .phases
        .transition(execution_id, phase, &[PhaseState::Pending], PhaseState::Running, now)
        .await
        .expect("begin phase");
    app.store
        .phases
        .transition(execution_id, phase, &[PhaseState::Running], PhaseState::Completed, now)
        .await
        .expect("complete phase");
}
