//! JSON-over-HTTP collaborator adapter.
//!
//! Each provider is a base URL answering one `POST` endpoint. Status codes
//! map onto the error taxonomy: 429 is rate limiting, 404/410 and other 4xx
//! are permanent, 5xx and timeouts are transient.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{
    CollectQuery, Collaborators, Content, ContentAnalyzer, ContentFetcher, Enricher,
    KeywordMetrics, KeywordMetricsProvider, MetricsQuery, Profile, ResultCollector, Score,
    ScoreCalculator, SearchResult,
};
use crate::config::ProvidersConfig;
use crate::models::work_item::{AnalysisDimension, DimensionScores};
use crate::{AppError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One HTTP provider endpoint.
#[derive(Clone)]
pub struct HttpProvider {
    name: &'static str,
    base_url: String,
    client: reqwest::Client,
}

/// Map a non-success status onto the error taxonomy.
#[must_use]
pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> AppError {
    let detail = format!("{provider} returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS {
        AppError::RateLimited(detail)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        AppError::Transient(detail)
    } else {
        AppError::Permanent(detail)
    }
}

impl HttpProvider {
    /// Create a provider rooted at `base_url`.
    #[must_use]
    pub fn new(name: &'static str, base_url: &str, client: reqwest::Client) -> Self {
        Self {
            name,
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        self.post_optional(path, body, false)
            .await?
            .ok_or_else(|| AppError::Permanent(format!("{} returned no body", self.name)))
    }

    /// `POST` that yields `None` on 404 when `missing_ok` is set.
    async fn post_optional<B, T>(&self, path: &str, body: &B, missing_ok: bool) -> Result<Option<T>>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{path}", self.base_url);
        debug!(provider = self.name, %url, "calling provider");
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if missing_ok && status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(self.name, status, &text));
        }
        Ok(Some(response.json::<T>().await?))
    }
}

impl KeywordMetricsProvider for HttpProvider {
    fn metrics<'a>(&'a self, query: &'a MetricsQuery) -> BoxFuture<'a, Result<KeywordMetrics>> {
        Box::pin(self.post("metrics", query))
    }
}

impl ResultCollector for HttpProvider {
    fn collect<'a>(&'a self, query: &'a CollectQuery) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
        Box::pin(self.post("results", query))
    }
}

impl ContentFetcher for HttpProvider {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Content>> {
        Box::pin(async move {
            let body = serde_json::json!({ "url": url });
            self.post("fetch", &body).await
        })
    }
}

impl Enricher for HttpProvider {
    fn enrich<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Option<Profile>>> {
        Box::pin(async move {
            let body = serde_json::json!({ "target": target });
            let profile: Option<Profile> = self.post_optional("enrich", &body, true).await?;
            Ok(profile.filter(|p| !p.is_null()))
        })
    }
}

impl ContentAnalyzer for HttpProvider {
    fn analyze<'a>(
        &'a self,
        url: &'a str,
        content: &'a str,
        metadata: &'a serde_json::Value,
        dimensions: &'a [AnalysisDimension],
    ) -> BoxFuture<'a, Result<DimensionScores>> {
        Box::pin(async move {
            if dimensions.is_empty() {
                return Err(AppError::Config("no analysis dimensions configured".into()));
            }
            let body = serde_json::json!({
                "url": url,
                "content": content,
                "metadata": metadata,
                "dimensions": dimensions,
            });
            self.post("analyze", &body).await
        })
    }
}

impl ScoreCalculator for HttpProvider {
    fn compute<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<Score>> {
        Box::pin(async move {
            let body = serde_json::json!({ "execution_id": execution_id });
            self.post("score", &body).await
        })
    }
}

fn require_url<'a>(name: &str, url: Option<&'a String>) -> Result<&'a str> {
    url.map(String::as_str)
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| AppError::Config(format!("providers.{name}_url is not configured")))
}

impl Collaborators {
    /// Build HTTP collaborators from the `[providers]` config section.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any provider URL is missing or the
    /// HTTP client cannot be constructed.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let timeout = config
            .request_timeout_seconds
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("http client: {e}")))?;

        let provider = |name: &'static str, url: Option<&String>| -> Result<Arc<HttpProvider>> {
            Ok(Arc::new(HttpProvider::new(
                name,
                require_url(name, url)?,
                client.clone(),
            )))
        };

        Ok(Self {
            metrics: provider("metrics", config.metrics_url.as_ref())?,
            collector: provider("collector", config.collector_url.as_ref())?,
            fetcher: provider("fetcher", config.fetcher_url.as_ref())?,
            company: provider("company", config.company_url.as_ref())?,
            video: provider("video", config.video_url.as_ref())?,
            analyzer: provider("analyzer", config.analyzer_url.as_ref())?,
            scorer: provider("scorer", config.scorer_url.as_ref())?,
        })
    }
}
