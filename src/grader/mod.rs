//! Rubric grading.
//!
//! The [`GraderEngine`] turns a `(rubric, prompt, response, expected)` tuple
//! into a [`Judgment`]:
//!
//! 1. derive a content-addressed [`CacheKey`] (inputs plus template digest)
//! 2. return the cached judgment if one exists
//! 3. otherwise render the rubric template and ask the [`Judge`]
//! 4. degrade judge faults into low-confidence judgments
//! 5. persist the outcome under its key
//!
//! Degraded judgments are cached like any other; clearing the cache
//! directory is the only way to retry them.

pub mod cache;
pub mod engine;
pub mod judge;
pub mod templates;

pub use cache::{CacheKey, CacheStats, JudgmentCache, CACHE_SCHEMA_VERSION};
pub use engine::GraderEngine;
pub use judge::{build_judge, Judge, JudgeRequest, KeywordJudge, LlmJudge};
pub use templates::{RubricTemplate, TemplateStore};

use serde::{Deserialize, Serialize};

/// Notes attached when the judge reply could not be parsed.
pub const PARSE_FAILURE_NOTES: &str = "parsing failed";

/// Score assigned when the judge reply could not be parsed.
pub const PARSE_FAILURE_SCORE: f64 = 1.0;

/// A rubric score with its rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub score: f64,
    pub notes: String,
}

impl Judgment {
    pub fn new(score: f64, notes: impl Into<String>) -> Self {
        Self {
            score,
            notes: notes.into(),
        }
    }

    /// Judgment used when the judge reply is not a usable JSON object.
    pub fn parse_failure() -> Self {
        Self::new(PARSE_FAILURE_SCORE, PARSE_FAILURE_NOTES)
    }

    /// Judgment used when the judge call itself failed.
    pub fn api_error(detail: impl std::fmt::Display) -> Self {
        Self::new(0.0, format!("API Error: {detail}"))
    }

    /// Returns the score clamped into `[0, max]`. Non-finite scores map to 0.
    pub fn clamped_score(&self, max: f64) -> f64 {
        if self.score.is_finite() {
            self.score.clamp(0.0, max)
        } else {
            0.0
        }
    }
}
