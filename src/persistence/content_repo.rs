//! Repository for the data phase executors produce: metrics, results,
//! enrichment profiles, fetched content, analyses and scores.
//!
//! Inserts are keyed on natural keys and ignore duplicates, so re-running
//! a phase after a crash never double-counts.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::collaborators::{KeywordMetrics, Profile, Score, SearchResult};
use crate::models::work_item::{DimensionScores, WorkItem};
use crate::Result;

use super::db::Database;
use super::fmt_ts;

/// Which enrichment a profile row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentKind {
    /// Company profile keyed by result domain.
    Company,
    /// Video metadata keyed by result URL.
    Video,
}

impl EnrichmentKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Video => "video",
        }
    }
}

/// Repository wrapper around `SQLite` for pipeline data.
#[derive(Clone)]
pub struct ContentRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    url: String,
    body: Option<String>,
    result_meta: Option<String>,
    company_profile: Option<String>,
    video_profile: Option<String>,
}

impl WorkItemRow {
    fn into_item(self, execution_id: &str) -> WorkItem {
        let parse = |raw: Option<String>| {
            raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
                .unwrap_or(serde_json::Value::Null)
        };
        let metadata = serde_json::json!({
            "result": parse(self.result_meta),
            "company": parse(self.company_profile),
            "video": parse(self.video_profile),
        });
        WorkItem {
            url: self.url,
            execution_id: execution_id.to_owned(),
            body: self.body.unwrap_or_default(),
            metadata,
        }
    }
}

const WORK_ITEM_SELECT: &str = "
SELECT c.url, c.body,
    (SELECT json_object('keyword', r.keyword, 'region', r.region,
                        'content_type', r.content_type, 'domain', r.domain,
                        'position', r.position, 'title', r.title)
       FROM search_result r
      WHERE r.execution_id = c.execution_id AND r.url = c.url
      ORDER BY r.position LIMIT 1) AS result_meta,
    (SELECT e.profile FROM enrichment e
      WHERE e.execution_id = c.execution_id AND e.kind = 'company'
        AND e.target = (SELECT r.domain FROM search_result r
                         WHERE r.execution_id = c.execution_id AND r.url = c.url
                         LIMIT 1)) AS company_profile,
    (SELECT e.profile FROM enrichment e
      WHERE e.execution_id = c.execution_id AND e.kind = 'video'
        AND e.target = c.url) AS video_profile
FROM content c";

impl ContentRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store metrics for a keyword, replacing any earlier figures.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert_keyword_metrics(
        &self,
        execution_id: &str,
        keyword: &str,
        region: &str,
        metrics: &KeywordMetrics,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO keyword_metrics
             (execution_id, keyword, region, search_volume, difficulty, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(execution_id)
        .bind(keyword)
        .bind(region)
        .bind(metrics.search_volume)
        .bind(metrics.difficulty)
        .bind(fmt_ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Whether metrics already exist for a keyword and region.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn has_keyword_metrics(
        &self,
        execution_id: &str,
        keyword: &str,
        region: &str,
    ) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM keyword_metrics
             WHERE execution_id = ?1 AND keyword = ?2 AND region = ?3",
        )
        .bind(execution_id)
        .bind(keyword)
        .bind(region)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(count > 0)
    }

    /// Insert search results, ignoring ones already stored.
    ///
    /// Returns the number of new rows.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn insert_results(&self, execution_id: &str, results: &[SearchResult]) -> Result<u64> {
        let now = fmt_ts(Utc::now());
        let mut tx = self.db.begin().await?;
        let mut inserted = 0;
        for result in results {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO search_result
                 (execution_id, keyword, region, content_type, url, domain, position, title,
                  collected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(execution_id)
            .bind(&result.keyword)
            .bind(&result.region)
            .bind(result.content_type.as_str())
            .bind(&result.url)
            .bind(&result.domain)
            .bind(result.position)
            .bind(&result.title)
            .bind(&now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Whether any results exist for a keyword, region and content type.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn has_results_for(
        &self,
        execution_id: &str,
        keyword: &str,
        region: &str,
        content_type: &str,
    ) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM search_result
             WHERE execution_id = ?1 AND keyword = ?2 AND region = ?3 AND content_type = ?4",
        )
        .bind(execution_id)
        .bind(keyword)
        .bind(region)
        .bind(content_type)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(count > 0)
    }

    /// Copy every result of `source` into `target`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the copy fails.
    pub async fn copy_results(&self, source: &str, target: &str) -> Result<u64> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO search_result
             (execution_id, keyword, region, content_type, url, domain, position, title,
              collected_at)
             SELECT ?1, keyword, region, content_type, url, domain, position, title, ?2
               FROM search_result WHERE execution_id = ?3",
        )
        .bind(target)
        .bind(fmt_ts(Utc::now()))
        .bind(source)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }

    /// Number of stored results.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_results(&self, execution_id: &str) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM search_result WHERE execution_id = ?1", execution_id)
            .await
    }

    /// Targets of `kind` that have no enrichment row yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn pending_enrichment_targets(
        &self,
        execution_id: &str,
        kind: EnrichmentKind,
    ) -> Result<Vec<String>> {
        let query = match kind {
            EnrichmentKind::Company => {
                "SELECT DISTINCT r.domain FROM search_result r
                  WHERE r.execution_id = ?1
                    AND NOT EXISTS (SELECT 1 FROM enrichment e
                                     WHERE e.execution_id = r.execution_id
                                       AND e.kind = 'company' AND e.target = r.domain)
                  ORDER BY r.domain"
            }
            EnrichmentKind::Video => {
                "SELECT DISTINCT r.url FROM search_result r
                  WHERE r.execution_id = ?1 AND r.content_type = 'video'
                    AND NOT EXISTS (SELECT 1 FROM enrichment e
                                     WHERE e.execution_id = r.execution_id
                                       AND e.kind = 'video' AND e.target = r.url)
                  ORDER BY r.url"
            }
        };
        let rows: Vec<(String,)> = sqlx::query_as(query)
            .bind(execution_id)
            .fetch_all(self.db.as_ref())
            .await?;
        Ok(rows.into_iter().map(|(target,)| target).collect())
    }

    /// Record an enrichment outcome; `None` records "provider had nothing".
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn record_enrichment(
        &self,
        execution_id: &str,
        kind: EnrichmentKind,
        target: &str,
        profile: Option<&Profile>,
    ) -> Result<()> {
        let profile = profile.map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT OR REPLACE INTO enrichment (execution_id, kind, target, profile, enriched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(execution_id)
        .bind(kind.as_str())
        .bind(target)
        .bind(&profile)
        .bind(fmt_ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Result URLs with no content row yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn urls_pending_scrape(&self, execution_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT r.url FROM search_result r
              WHERE r.execution_id = ?1
                AND NOT EXISTS (SELECT 1 FROM content c
                                 WHERE c.execution_id = r.execution_id AND c.url = r.url)
              ORDER BY r.url",
        )
        .bind(execution_id)
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    /// Store fetched page text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn record_content(&self, execution_id: &str, url: &str, body: &str) -> Result<()> {
        let length = i64::try_from(body.chars().count()).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT OR REPLACE INTO content
             (execution_id, url, status, body, content_length, error, fetched_at)
             VALUES (?1, ?2, 'fetched', ?3, ?4, NULL, ?5)",
        )
        .bind(execution_id)
        .bind(url)
        .bind(body)
        .bind(length)
        .bind(fmt_ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Record a permanent fetch failure so the URL is not fetched again.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn record_fetch_failure(
        &self,
        execution_id: &str,
        url: &str,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO content
             (execution_id, url, status, body, content_length, error, fetched_at)
             VALUES (?1, ?2, 'failed', NULL, 0, ?3, ?4)",
        )
        .bind(execution_id)
        .bind(url)
        .bind(error)
        .bind(fmt_ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Up to `limit` ready items with no analysis record, ordered by URL,
    /// skipping anything in `exclude`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn ready_unanalyzed(
        &self,
        execution_id: &str,
        min_length: i64,
        limit: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<WorkItem>> {
        self.ready_items(execution_id, min_length, limit, exclude, true)
            .await
    }

    /// Up to `limit` ready items regardless of prior analysis, ordered by
    /// URL, skipping anything in `exclude`. Used when reprocessing, where
    /// `exclude` is everything the session has already claimed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn ready_for_reanalysis(
        &self,
        execution_id: &str,
        min_length: i64,
        limit: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<WorkItem>> {
        self.ready_items(execution_id, min_length, limit, exclude, false)
            .await
    }

    async fn ready_items(
        &self,
        execution_id: &str,
        min_length: i64,
        limit: usize,
        exclude: &HashSet<String>,
        skip_analyzed: bool,
    ) -> Result<Vec<WorkItem>> {
        let fetch_limit = i64::try_from(limit.saturating_add(exclude.len())).unwrap_or(i64::MAX);
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "{WORK_ITEM_SELECT}
              WHERE c.execution_id = ?1 AND c.status = 'fetched' AND c.content_length >= ?2
                AND (?4 = 0 OR NOT EXISTS (SELECT 1 FROM content_analysis a
                                            WHERE a.execution_id = c.execution_id AND a.url = c.url))
              ORDER BY c.url LIMIT ?3"
        ))
        .bind(execution_id)
        .bind(min_length)
        .bind(fetch_limit)
        .bind(skip_analyzed)
        .fetch_all(self.db.as_ref())
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| !exclude.contains(&row.url))
            .take(limit)
            .map(|row| row.into_item(execution_id))
            .collect())
    }

    /// Number of ready items with no analysis record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_ready_unanalyzed(&self, execution_id: &str, min_length: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM content c
              WHERE c.execution_id = ?1 AND c.status = 'fetched' AND c.content_length >= ?2
                AND NOT EXISTS (SELECT 1 FROM content_analysis a
                                 WHERE a.execution_id = c.execution_id AND a.url = c.url)",
        )
        .bind(execution_id)
        .bind(min_length)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(count)
    }

    /// Store (or replace) an analysis.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn record_analysis(
        &self,
        execution_id: &str,
        url: &str,
        scores: &DimensionScores,
        primary_dimension: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO content_analysis
             (execution_id, url, scores, primary_dimension, analyzed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(execution_id)
        .bind(url)
        .bind(serde_json::to_string(scores)?)
        .bind(primary_dimension)
        .bind(fmt_ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Delete every analysis of an execution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_analyses(&self, execution_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM content_analysis WHERE execution_id = ?1")
            .bind(execution_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of stored analyses.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_analyses(&self, execution_id: &str) -> Result<i64> {
        self.count(
            "SELECT COUNT(*) FROM content_analysis WHERE execution_id = ?1",
            execution_id,
        )
        .await
    }

    /// Store (or replace) the execution score.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn record_score(&self, execution_id: &str, score: &Score) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO score (execution_id, value, components, computed_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(execution_id)
        .bind(score.value)
        .bind(serde_json::to_string(&score.components)?)
        .bind(fmt_ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Number of stored scores (zero or one).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_scores(&self, execution_id: &str) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM score WHERE execution_id = ?1", execution_id)
            .await
    }

    /// Minimum viable data: at least one result and at least one analysis
    /// or score.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn has_viable_data(&self, execution_id: &str) -> Result<bool> {
        if self.count_results(execution_id).await? == 0 {
            return Ok(false);
        }
        Ok(self.count_analyses(execution_id).await? > 0
            || self.count_scores(execution_id).await? > 0)
    }

    async fn count(&self, query: &str, execution_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(query)
            .bind(execution_id)
            .fetch_one(self.db.as_ref())
            .await?;
        Ok(count)
    }
}
