//! Analyzable content units and analysis configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// One axis the analyzer scores content against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AnalysisDimension {
    /// Dimension identifier.
    pub name: String,
    /// Criteria text handed to the analyzer.
    #[serde(default)]
    pub criteria: Vec<String>,
}

/// Check that a dimension set can be handed to the analyzer.
///
/// # Errors
///
/// Returns `AppError::Config` if the set is empty or any dimension has
/// no name or no criteria.
pub fn validate_dimensions(dimensions: &[AnalysisDimension]) -> Result<()> {
    if dimensions.is_empty() {
        return Err(AppError::Config("no analysis dimensions configured".into()));
    }
    for dimension in dimensions {
        if dimension.name.trim().is_empty() {
            return Err(AppError::Config("analysis dimension name is empty".into()));
        }
        if dimension.criteria.iter().all(|c| c.trim().is_empty()) {
            return Err(AppError::Config(format!(
                "analysis dimension {} has no criteria",
                dimension.name
            )));
        }
    }
    Ok(())
}

/// Content that has been fetched and is eligible for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Page URL; the stable discovery ordering key.
    pub url: String,
    /// Owning execution.
    pub execution_id: String,
    /// Fetched page text.
    pub body: String,
    /// Result metadata and any enrichment profile.
    pub metadata: serde_json::Value,
}

/// Analyzer output: one score per dimension.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct DimensionScores {
    /// Score keyed by dimension name.
    pub scores: BTreeMap<String, f64>,
}

/// Strategy for naming the primary dimension of an analysis.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryDimensionPolicy {
    /// Highest-scoring dimension; ties go to the earlier configured one.
    #[default]
    HighestScore,
    /// First configured dimension the analyzer returned a score for.
    FirstConfigured,
}

impl PrimaryDimensionPolicy {
    /// Pick the primary dimension from analyzer output. Non-finite scores
    /// are ignored.
    #[must_use]
    pub fn select(
        self,
        dimensions: &[AnalysisDimension],
        scores: &DimensionScores,
    ) -> Option<String> {
        let scored = dimensions
            .iter()
            .filter_map(|d| scores.scores.get(&d.name).map(|score| (d, *score)))
            .filter(|(_, score)| score.is_finite());
        match self {
            Self::FirstConfigured => scored.map(|(d, _)| d.name.clone()).next(),
            Self::HighestScore => scored
                .fold(None::<(&AnalysisDimension, f64)>, |best, (d, score)| match best {
                    Some((_, top)) if top >= score => best,
                    _ => Some((d, score)),
                })
                .map(|(d, _)| d.name.clone()),
        }
    }
}
