//! Per-execution pipeline configuration.
//!
//! Persisted as JSON on the execution row so a resumed or restarted
//! execution sees exactly the scope it was started with.

use serde::{Deserialize, Serialize};

use super::phase::PhaseName;
use super::work_item::{AnalysisDimension, PrimaryDimensionPolicy};
use crate::{AppError, Result};

/// Content sub-type a search result belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Organic web results.
    Organic,
    /// News results.
    News,
    /// Video results.
    Video,
}

impl ContentType {
    /// Persisted name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Organic => "organic",
            Self::News => "news",
            Self::Video => "video",
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "organic" => Ok(Self::Organic),
            "news" => Ok(Self::News),
            "video" => Ok(Self::Video),
            other => Err(AppError::Config(format!("unknown content type: {other}"))),
        }
    }
}

fn default_content_types() -> Vec<ContentType> {
    vec![ContentType::Organic]
}

fn default_true() -> bool {
    true
}

fn default_phase_concurrency() -> usize {
    5
}

fn default_testing_batch_size() -> usize {
    2
}

/// Scope and tuning for one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Keywords to collect results for.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Region codes to collect results in.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Content sub-types to collect.
    #[serde(default = "default_content_types")]
    pub content_types: Vec<ContentType>,

    /// Concurrent keyword-metrics lookups.
    #[serde(default = "default_phase_concurrency")]
    pub max_concurrent_metrics: usize,
    /// Concurrent result-collection calls.
    #[serde(default = "default_phase_concurrency")]
    pub max_concurrent_collection: usize,
    /// Concurrent enrichment calls.
    #[serde(default = "default_phase_concurrency")]
    pub max_concurrent_enrichment: usize,
    /// Concurrent page fetches.
    #[serde(default = "default_phase_concurrency")]
    pub max_concurrent_scraping: usize,

    /// Run the metrics phase.
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    /// Run company enrichment.
    #[serde(default = "default_true")]
    pub enable_company_enrichment: bool,
    /// Run video enrichment.
    #[serde(default = "default_true")]
    pub enable_video_enrichment: bool,
    /// Run scraping.
    #[serde(default = "default_true")]
    pub enable_scraping: bool,
    /// Run content analysis.
    #[serde(default = "default_true")]
    pub enable_analysis: bool,
    /// Run scoring.
    #[serde(default = "default_true")]
    pub enable_scoring: bool,

    /// Ask collaborators to bypass their caches.
    #[serde(default)]
    pub force_refresh: bool,
    /// Shrink scope for fast iteration.
    #[serde(default)]
    pub testing_mode: bool,
    /// Keywords and regions kept in testing mode.
    #[serde(default = "default_testing_batch_size")]
    pub testing_batch_size: usize,
    /// Drop retry backoff in testing mode.
    #[serde(default)]
    pub testing_skip_delays: bool,
    /// Copy results from a prior execution instead of collecting.
    #[serde(default)]
    pub reuse_results_from_execution_id: Option<String>,

    /// Dimensions the analyzer scores content against.
    #[serde(default)]
    pub analysis_dimensions: Vec<AnalysisDimension>,
    /// How the primary dimension is chosen from analyzer output.
    #[serde(default)]
    pub primary_dimension_policy: PrimaryDimensionPolicy,
    /// Re-analyze everything, including previously analyzed content.
    #[serde(default)]
    pub fresh_analysis: bool,

    /// Schedule that launched this execution, if any.
    #[serde(default)]
    pub schedule_id: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            regions: Vec::new(),
            content_types: default_content_types(),
            max_concurrent_metrics: default_phase_concurrency(),
            max_concurrent_collection: default_phase_concurrency(),
            max_concurrent_enrichment: default_phase_concurrency(),
            max_concurrent_scraping: default_phase_concurrency(),
            enable_metrics: true,
            enable_company_enrichment: true,
            enable_video_enrichment: true,
            enable_scraping: true,
            enable_analysis: true,
            enable_scoring: true,
            force_refresh: false,
            testing_mode: false,
            testing_batch_size: default_testing_batch_size(),
            testing_skip_delays: false,
            reuse_results_from_execution_id: None,
            analysis_dimensions: Vec::new(),
            primary_dimension_policy: PrimaryDimensionPolicy::default(),
            fresh_analysis: false,
            schedule_id: None,
        }
    }
}

impl PipelineConfig {
    /// Whether a phase participates in this execution.
    ///
    /// Result collection and snapshot always run; collection is satisfied
    /// by copying when `reuse_results_from_execution_id` is set.
    #[must_use]
    pub fn phase_enabled(&self, phase: PhaseName) -> bool {
        match phase {
            PhaseName::Metrics => self.enable_metrics,
            PhaseName::CompanyEnrichment => self.enable_company_enrichment,
            PhaseName::VideoEnrichment => {
                self.enable_video_enrichment && self.content_types.contains(&ContentType::Video)
            }
            PhaseName::ContentScraping => self.enable_scraping,
            PhaseName::ContentAnalysis => self.enable_analysis,
            PhaseName::Scoring => self.enable_scoring,
            PhaseName::ResultCollection | PhaseName::Snapshot => true,
        }
    }

    /// Keywords in scope, shrunk in testing mode.
    #[must_use]
    pub fn effective_keywords(&self) -> &[String] {
        self.shrink(&self.keywords)
    }

    /// Regions in scope, shrunk in testing mode.
    #[must_use]
    pub fn effective_regions(&self) -> &[String] {
        self.shrink(&self.regions)
    }

    fn shrink<'a>(&self, items: &'a [String]) -> &'a [String] {
        if self.testing_mode {
            &items[..items.len().min(self.testing_batch_size.max(1))]
        } else {
            items
        }
    }

    /// Whether retry backoff should be skipped.
    #[must_use]
    pub fn skip_delays(&self) -> bool {
        self.testing_mode && self.testing_skip_delays
    }

    /// Validate scope before an execution is created.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when there is nothing to collect or a
    /// concurrency cap is zero.
    pub fn validate(&self) -> Result<()> {
        if self.reuse_results_from_execution_id.is_none() {
            if self.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(AppError::Config("keywords must not be empty".into()));
            }
            if self.regions.is_empty() {
                return Err(AppError::Config("regions must not be empty".into()));
            }
            if self.content_types.is_empty() {
                return Err(AppError::Config("content_types must not be empty".into()));
            }
        }
        if [
            self.max_concurrent_metrics,
            self.max_concurrent_collection,
            self.max_concurrent_enrichment,
            self.max_concurrent_scraping,
        ]
        .contains(&0)
        {
            return Err(AppError::Config(
                "max_concurrent_* values must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply an override, touching only phases that have not started.
    pub fn apply_override(&mut self, patch: &PipelineConfigOverride, not_started: &[PhaseName]) {
        let open = |phase: PhaseName| not_started.contains(&phase);
        if let Some(value) = patch.max_concurrent_metrics.filter(|_| open(PhaseName::Metrics)) {
            self.max_concurrent_metrics = value;
        }
        if let Some(value) = patch
            .max_concurrent_collection
            .filter(|_| open(PhaseName::ResultCollection))
        {
            self.max_concurrent_collection = value;
        }
        if let Some(value) = patch.max_concurrent_enrichment.filter(|_| {
            open(PhaseName::CompanyEnrichment) || open(PhaseName::VideoEnrichment)
        }) {
            self.max_concurrent_enrichment = value;
        }
        if let Some(value) = patch
            .max_concurrent_scraping
            .filter(|_| open(PhaseName::ContentScraping))
        {
            self.max_concurrent_scraping = value;
        }
        if let Some(value) = patch.enable_scoring.filter(|_| open(PhaseName::Scoring)) {
            self.enable_scoring = value;
        }
        if let Some(value) = patch.enable_analysis.filter(|_| open(PhaseName::ContentAnalysis)) {
            self.enable_analysis = value;
        }
        if let Some(dimensions) = patch
            .analysis_dimensions
            .as_ref()
            .filter(|_| open(PhaseName::ContentAnalysis))
        {
            self.analysis_dimensions.clone_from(dimensions);
        }
        if let Some(value) = patch.force_refresh {
            self.force_refresh = value;
        }
    }
}

/// Typed partial override accepted by `resume`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfigOverride {
    /// New metrics concurrency.
    pub max_concurrent_metrics: Option<usize>,
    /// New collection concurrency.
    pub max_concurrent_collection: Option<usize>,
    /// New enrichment concurrency.
    pub max_concurrent_enrichment: Option<usize>,
    /// New scraping concurrency.
    pub max_concurrent_scraping: Option<usize>,
    /// Toggle scoring.
    pub enable_scoring: Option<bool>,
    /// Toggle analysis.
    pub enable_analysis: Option<bool>,
    /// Replace analysis dimensions.
    pub analysis_dimensions: Option<Vec<AnalysisDimension>>,
    /// Toggle cache bypass for remaining work.
    pub force_refresh: Option<bool>,
}
