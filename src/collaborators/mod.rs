//! Contracts for the external services the pipeline depends on.
//!
//! The orchestrator only ever talks to these traits. Every call made
//! through them is wrapped by a [`CallGuard`](crate::resilience::CallGuard)
//! so it is bounded by the global semaphore and the dependency's circuit
//! breaker. [`http`] provides a JSON-over-HTTP implementation.

pub mod http;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::models::pipeline::ContentType;
use crate::models::work_item::{AnalysisDimension, DimensionScores};
use crate::Result;

/// Circuit breaker names, one per external dependency.
pub mod deps {
    /// Keyword metrics provider.
    pub const METRICS: &str = "metrics";
    /// Search-results provider.
    pub const COLLECTOR: &str = "collector";
    /// Web-scraping provider.
    pub const FETCHER: &str = "fetcher";
    /// Company-data provider.
    pub const COMPANY: &str = "company_data";
    /// Video-metadata provider.
    pub const VIDEO: &str = "video_data";
    /// Language-model analysis provider.
    pub const ANALYZER: &str = "analyzer";
    /// Scoring provider.
    pub const SCORER: &str = "scorer";
}

/// Search demand figures for one keyword in one region.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct KeywordMetrics {
    /// Monthly search volume.
    pub search_volume: Option<i64>,
    /// Ranking difficulty, 0-100.
    pub difficulty: Option<f64>,
}

/// Lookup parameters for keyword metrics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MetricsQuery {
    /// Keyword.
    pub keyword: String,
    /// Region code.
    pub region: String,
    /// Bypass provider caches.
    pub force_refresh: bool,
}

/// Lookup parameters for search results.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CollectQuery {
    /// Keyword.
    pub keyword: String,
    /// Region code.
    pub region: String,
    /// Result sub-type.
    pub content_type: ContentType,
    /// Bypass provider caches.
    pub force_refresh: bool,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SearchResult {
    /// Keyword the result ranked for.
    pub keyword: String,
    /// Region the result ranked in.
    pub region: String,
    /// Result sub-type.
    pub content_type: ContentType,
    /// Result URL.
    pub url: String,
    /// Host of `url`.
    pub domain: String,
    /// 1-based rank.
    pub position: i64,
    /// Result title.
    #[serde(default)]
    pub title: Option<String>,
}

/// Fetched page content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Content {
    /// Final URL.
    pub url: String,
    /// Extracted text.
    pub body: String,
}

/// Opaque enrichment profile.
pub type Profile = serde_json::Value;

/// Aggregate score for an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Score {
    /// Headline value.
    pub value: f64,
    /// Per-component breakdown.
    #[serde(default)]
    pub components: serde_json::Value,
}

/// Provides search demand figures.
pub trait KeywordMetricsProvider: Send + Sync {
    /// Fetch metrics for one keyword and region.
    ///
    /// # Errors
    ///
    /// Returns a transient, rate-limit or permanent error from the provider.
    fn metrics<'a>(&'a self, query: &'a MetricsQuery) -> BoxFuture<'a, Result<KeywordMetrics>>;
}

/// Provides ranked search results.
pub trait ResultCollector: Send + Sync {
    /// Collect results for one keyword, region and content type.
    ///
    /// # Errors
    ///
    /// Returns a transient, rate-limit or permanent error from the provider.
    fn collect<'a>(&'a self, query: &'a CollectQuery) -> BoxFuture<'a, Result<Vec<SearchResult>>>;
}

/// Fetches page content.
pub trait ContentFetcher: Send + Sync {
    /// Fetch one URL.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Permanent` for pages that are gone, otherwise a
    /// transient or rate-limit error.
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Content>>;
}

/// Looks up a profile for a domain or URL.
pub trait Enricher: Send + Sync {
    /// Enrich one target; `None` when the provider knows nothing about it.
    ///
    /// # Errors
    ///
    /// Returns a transient, rate-limit or permanent error from the provider.
    fn enrich<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Option<Profile>>>;
}

/// Scores content along configured dimensions.
pub trait ContentAnalyzer: Send + Sync {
    /// Analyze one piece of content.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when `dimensions` is empty, otherwise a
    /// transient, rate-limit or permanent error from the provider.
    fn analyze<'a>(
        &'a self,
        url: &'a str,
        content: &'a str,
        metadata: &'a serde_json::Value,
        dimensions: &'a [AnalysisDimension],
    ) -> BoxFuture<'a, Result<DimensionScores>>;
}

/// Computes the aggregate score of an execution.
pub trait ScoreCalculator: Send + Sync {
    /// Compute the score from everything persisted for the execution.
    ///
    /// # Errors
    ///
    /// Returns a transient, rate-limit or permanent error from the provider.
    fn compute<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<Score>>;
}

/// The full set of collaborators, constructed once and passed explicitly.
#[derive(Clone)]
pub struct Collaborators {
    /// Keyword metrics.
    pub metrics: Arc<dyn KeywordMetricsProvider>,
    /// Search results.
    pub collector: Arc<dyn ResultCollector>,
    /// Page fetching.
    pub fetcher: Arc<dyn ContentFetcher>,
    /// Company data, keyed by domain.
    pub company: Arc<dyn Enricher>,
    /// Video metadata, keyed by URL.
    pub video: Arc<dyn Enricher>,
    /// Content analysis.
    pub analyzer: Arc<dyn ContentAnalyzer>,
    /// Scoring.
    pub scorer: Arc<dyn ScoreCalculator>,
}
