//! Report aggregation.
//!
//! [`aggregate`] folds per-test rubric judgments into an [`EvaluationReport`]:
//! a clamped average per weighted rubric and a 0-100 composite score.
//! [`ReportWriter`] persists the JSON document and its HTML rendering.

pub mod html;
pub mod writer;

pub use html::render_html;
pub use writer::{ReportPaths, ReportWriter};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{RubricWeight, RubricWeights};
use crate::grader::Judgment;

/// Current report schema version.
pub const REPORT_SCHEMA_VERSION: u64 = 1;

/// One rubric's judgment for one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricScore {
    pub rubric: String,
    pub score: f64,
    pub notes: String,
}

impl RubricScore {
    pub fn new(rubric: impl Into<String>, judgment: Judgment) -> Self {
        Self {
            rubric: rubric.into(),
            score: judgment.score,
            notes: judgment.notes,
        }
    }
}

/// All rubric judgments for one test, in grading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestJudgments {
    pub test_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub trace_path: Option<PathBuf>,
    pub per_rubric: Vec<RubricScore>,
}

/// Average score of one rubric across a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricAverage {
    pub rubric: String,
    pub average: f64,
    pub weight: f64,
    /// Number of judgments that went into the average.
    pub observations: usize,
}

/// Graded outcome of one suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub schema_version: u64,
    pub run_id: String,
    pub suite: String,
    pub agent_archive: String,
    /// Weighted composite score, 0-100, rounded to two decimals.
    pub total_score: f64,
    /// Per-rubric averages in weight-table order.
    pub rubric_averages: Vec<RubricAverage>,
    /// Per-test breakdown in suite-declaration order.
    pub tests: Vec<TestJudgments>,
    pub weights: Vec<RubricWeight>,
    pub score_max: f64,
    pub generated_at: DateTime<Utc>,
}

impl EvaluationReport {
    /// Average for `rubric`, if it is weighted.
    pub fn average(&self, rubric: &str) -> Option<f64> {
        self.rubric_averages
            .iter()
            .find(|a| a.rubric == rubric)
            .map(|a| a.average)
    }
}

/// Builds the report for a run.
///
/// Scores are clamped into `[0, score_max]` before averaging. Judgments for
/// rubrics absent from `weights` stay in the per-test breakdown but do not
/// contribute to any average. A weighted rubric with no judgments averages 0.
pub fn aggregate(
    run_id: &str,
    suite: &str,
    agent_archive: &str,
    tests: Vec<TestJudgments>,
    weights: &RubricWeights,
    score_max: f64,
) -> EvaluationReport {
    let rubric_averages: Vec<RubricAverage> = weights
        .iter()
        .map(|entry| {
            let scores: Vec<f64> = tests
                .iter()
                .flat_map(|t| t.per_rubric.iter())
                .filter(|s| s.rubric == entry.rubric)
                .map(|s| Judgment::new(s.score, "").clamped_score(score_max))
                .collect();

            let average = if scores.is_empty() {
                0.0
            } else {
                round2(scores.iter().sum::<f64>() / scores.len() as f64)
            };

            RubricAverage {
                rubric: entry.rubric.clone(),
                average,
                weight: entry.weight,
                observations: scores.len(),
            }
        })
        .collect();

    let composite: f64 = rubric_averages
        .iter()
        .map(|a| (a.average / score_max) * a.weight)
        .sum();
    let total_score = round2(composite * 100.0);

    debug!(run_id, total_score, tests = tests.len(), "Aggregated report");

    EvaluationReport {
        schema_version: REPORT_SCHEMA_VERSION,
        run_id: run_id.to_string(),
        suite: suite.to_string(),
        agent_archive: agent_archive.to_string(),
        total_score,
        rubric_averages,
        tests,
        weights: weights.as_slice().to_vec(),
        score_max,
        generated_at: Utc::now(),
    }
}

/// Rounds half away from zero to two decimals.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test(id: &str, scores: &[(&str, f64)]) -> TestJudgments {
        TestJudgments {
            test_id: id.to_string(),
            job_id: Some(format!("job-{id}")),
            trace_path: None,
            per_rubric: scores
                .iter()
                .map(|(rubric, score)| RubricScore::new(*rubric, Judgment::new(*score, "n")))
                .collect(),
        }
    }

    #[test]
    fn test_composite_matches_weighted_averages() {
        let tests = vec![test(
            "t1",
            &[
                ("correctness", 8.0),
                ("reasoning", 7.0),
                ("tool_usage", 7.0),
                ("safety", 9.0),
                ("robustness", 7.0),
            ],
        )];

        let report = aggregate("run", "suite", "/a.tar.gz", tests, &RubricWeights::default(), 10.0);

        assert_eq!(report.total_score, 76.5);
        assert_eq!(report.average("correctness"), Some(8.0));
        assert_eq!(report.schema_version, REPORT_SCHEMA_VERSION);
        assert_eq!(report.weights.len(), 5);
    }

    #[test]
    fn test_unobserved_rubric_contributes_zero() {
        let tests = vec![test(
            "t1",
            &[
                ("correctness", 8.0),
                ("reasoning", 6.0),
                ("tool_usage", 10.0),
                ("safety", 9.0),
            ],
        )];

        let report = aggregate("run", "suite", "", tests, &RubricWeights::default(), 10.0);

        // 100 * (0.8*0.35 + 0.6*0.25 + 1.0*0.20 + 0.9*0.15 + 0*0.05)
        assert_eq!(report.total_score, 76.5);
        assert_eq!(report.average("robustness"), Some(0.0));
        let robustness = report
            .rubric_averages
            .iter()
            .find(|r| r.rubric == "robustness")
            .unwrap();
        assert_eq!(robustness.observations, 0);
        assert_eq!(robustness.weight, 0.05);
    }

    #[test]
    fn test_averages_round_and_clamp() {
        let tests = vec![
            test("t1", &[("correctness", 7.0)]),
            test("t2", &[("correctness", 8.0)]),
            test("t3", &[("correctness", 14.0)]),
        ];
        let report = aggregate("run", "s", "", tests, &RubricWeights::default(), 10.0);

        // (7 + 8 + 10) / 3 = 8.333...
        assert_eq!(report.average("correctness"), Some(8.33));
        assert_eq!(report.rubric_averages[0].observations, 3);
        assert_eq!(report.average("safety"), Some(0.0));
        assert_eq!(report.rubric_averages[3].observations, 0);
    }

    #[test]
    fn test_unweighted_rubrics_are_ignored() {
        let weights = RubricWeights::new(vec![RubricWeight::new("correctness", 1.0)]).unwrap();
        let tests = vec![test("t1", &[("correctness", 5.0), ("style", 10.0)])];

        let report = aggregate("run", "s", "", tests, &weights, 10.0);

        assert_eq!(report.total_score, 50.0);
        assert_eq!(report.rubric_averages.len(), 1);
        assert_eq!(report.tests[0].per_rubric.len(), 2);
    }

    #[test]
    fn test_result_is_independent_of_test_order() {
        let a = test("a", &[("correctness", 3.0), ("safety", 9.5)]);
        let b = test("b", &[("correctness", 6.5), ("safety", 1.0)]);
        let c = test("c", &[("correctness", 10.0), ("safety", 4.0)]);
        let weights = RubricWeights::default();

        let forward = aggregate("r", "s", "", vec![a.clone(), b.clone(), c.clone()], &weights, 10.0);
        let reversed = aggregate("r", "s", "", vec![c, b, a], &weights, 10.0);

        assert_eq!(forward.total_score, reversed.total_score);
        assert_eq!(forward.rubric_averages, reversed.rubric_averages);
        assert_eq!(forward.tests[0].test_id, "a");
        assert_eq!(reversed.tests[0].test_id, "c");
    }

    #[test]
    fn test_empty_run_scores_zero() {
        let report = aggregate("r", "s", "", Vec::new(), &RubricWeights::default(), 10.0);
        assert_eq!(report.total_score, 0.0);
        assert!(report.tests.is_empty());
    }
}
