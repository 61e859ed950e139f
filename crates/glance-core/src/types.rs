use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;

// =============================================================================
// Search results
// =============================================================================

/// One gallery hit: the public URL of the image and its cosine similarity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

/// Coarse label attached to a similarity score for display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Strong,
    Medium,
    Weak,
    Poor,
}

impl Quality {
    /// Bucket a score using the configured cutoffs.
    pub fn classify(score: f32, thresholds: &QualityConfig) -> Self {
        if score >= thresholds.strong {
            Quality::Strong
        } else if score >= thresholds.medium {
            Quality::Medium
        } else if score >= thresholds.weak {
            Quality::Weak
        } else {
            Quality::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Strong => "strong",
            Quality::Medium => "medium",
            Quality::Weak => "weak",
            Quality::Poor => "poor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strong" => Some(Quality::Strong),
            "medium" => Some(Quality::Medium),
            "weak" => Some(Quality::Weak),
            "poor" => Some(Quality::Poor),
            _ => None,
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A search result as persisted against a history record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    /// 1-based position in the result list.
    pub rank: u32,
    pub url: String,
    pub score: f32,
    pub quality: Quality,
}

impl RankedResult {
    /// Attach 1-based ranks and quality labels to an ordered result list.
    pub fn rank_all(results: &[SearchResult], thresholds: &QualityConfig) -> Vec<RankedResult> {
        results
            .iter()
            .enumerate()
            .map(|(i, r)| RankedResult {
                rank: (i + 1) as u32,
                url: r.url.clone(),
                score: r.score,
                quality: Quality::classify(r.score, thresholds),
            })
            .collect()
    }
}

/// Summary of a result list's scores.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityStats {
    pub avg: Option<f32>,
    pub best: Option<f32>,
    pub total: usize,
    pub strong: usize,
    pub medium: usize,
    pub weak: usize,
    pub poor: usize,
}

impl QualityStats {
    /// Summarize scores, skipping NaN and infinite values.
    pub fn from_scores<I>(scores: I, thresholds: &QualityConfig) -> Self
    where
        I: IntoIterator<Item = f32>,
    {
        let vals: Vec<f32> = scores.into_iter().filter(|s| s.is_finite()).collect();
        if vals.is_empty() {
            return Self::default();
        }

        let mut stats = Self {
            avg: Some(vals.iter().sum::<f32>() / vals.len() as f32),
            best: vals.iter().copied().reduce(f32::max),
            total: vals.len(),
            ..Self::default()
        };
        for &s in &vals {
            match Quality::classify(s, thresholds) {
                Quality::Strong => stats.strong += 1,
                Quality::Medium => stats.medium += 1,
                Quality::Weak => stats.weak += 1,
                Quality::Poor => stats.poor += 1,
            }
        }
        stats
    }
}

// =============================================================================
// Vector helpers
// =============================================================================

/// L2-normalize a vector in place, adding `eps` to the norm.
pub fn l2_normalize(values: &mut [f32], eps: f32) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt() + eps;
    for v in values.iter_mut() {
        *v /= norm;
    }
}
