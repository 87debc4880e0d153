//! Grading stage: raw-results bundle in, evaluation report out.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RubricWeights;
use crate::error::{GraderError, ReportError};
use crate::grader::GraderEngine;
use crate::metrics;
use crate::report::{aggregate, EvaluationReport, ReportPaths, ReportWriter, RubricScore, TestJudgments};
use crate::suite::{RawResultsBundle, TestRecord};

/// Rubric judged on the serialised tool calls instead of stdout.
pub const TOOL_USAGE_RUBRIC: &str = "tool_usage";

/// Grades bundles and writes reports.
pub struct Evaluator {
    grader: Arc<GraderEngine>,
    weights: RubricWeights,
    score_max: f64,
    all_rubrics: bool,
    reports: ReportWriter,
}

impl Evaluator {
    /// Creates an evaluator that grades every record on every weighted rubric.
    pub fn new(
        grader: Arc<GraderEngine>,
        weights: RubricWeights,
        score_max: f64,
        reports: ReportWriter,
    ) -> Self {
        Self {
            grader,
            weights,
            score_max,
            all_rubrics: true,
            reports,
        }
    }

    /// When disabled, each record is graded only on its own rubric.
    pub fn with_all_rubrics(mut self, all_rubrics: bool) -> Self {
        self.all_rubrics = all_rubrics;
        self
    }

    pub fn grader(&self) -> &Arc<GraderEngine> {
        &self.grader
    }

    pub fn reports(&self) -> &ReportWriter {
        &self.reports
    }

    /// Reads the bundle at `path`, grades it and writes the report.
    ///
    /// # Errors
    ///
    /// `ReportError::BundleNotFound` if the bundle is missing, schema errors
    /// for unreadable bundles, and I/O errors from writing the report.
    /// Judge failures never surface here.
    pub async fn evaluate_bundle(
        &self,
        path: &Path,
    ) -> Result<(EvaluationReport, ReportPaths), ReportError> {
        let bundle = RawResultsBundle::read(path)?;
        let report = self.evaluate(&bundle).await?;
        let paths = self.reports.write(&report)?;
        Ok((report, paths))
    }

    /// Grades every record of a bundle, in bundle order, and aggregates.
    pub async fn evaluate(&self, bundle: &RawResultsBundle) -> Result<EvaluationReport, ReportError> {
        info!(run_id = %bundle.run_id, tests = bundle.tests.len(), "Evaluating bundle");

        let mut tests = Vec::with_capacity(bundle.tests.len());
        for record in &bundle.tests {
            tests.push(self.grade_record(record).await?);
        }

        let report = aggregate(
            &bundle.run_id,
            &bundle.suite,
            &bundle.agent_archive.display().to_string(),
            tests,
            &self.weights,
            self.score_max,
        );
        metrics::record_composite_score(report.total_score);
        info!(run_id = %report.run_id, total_score = report.total_score, "Evaluation complete");
        Ok(report)
    }

    /// Grades one record on each applicable rubric.
    ///
    /// Rubrics without a loaded template are skipped with a warning.
    pub async fn grade_record(&self, record: &TestRecord) -> Result<TestJudgments, ReportError> {
        let rubrics: Vec<&str> = if self.all_rubrics {
            self.weights.rubrics().collect()
        } else {
            vec![record.rubric.as_str()]
        };

        let stdout = record
            .trace
            .as_ref()
            .map(|t| t.stdout_snippet.as_str())
            .unwrap_or_default();
        let tool_calls = record
            .trace
            .as_ref()
            .map(|t| t.tool_calls_json())
            .unwrap_or_default();
        let expected = record.expectation.expected_text();
        let expected_tool = record.expectation.expected_tool_text();

        let mut per_rubric = Vec::with_capacity(rubrics.len());
        for rubric in rubrics {
            let (response, expected) = if rubric == TOOL_USAGE_RUBRIC {
                (tool_calls.as_str(), expected_tool.as_str())
            } else {
                (stdout, expected.as_str())
            };

            match self
                .grader
                .grade(rubric, &record.prompt, response, expected)
                .await
            {
                Ok(judgment) => per_rubric.push(RubricScore::new(rubric, judgment)),
                Err(GraderError::UnknownRubric(name)) => {
                    warn!(test_id = %record.test_id, rubric = %name, "Skipping rubric without template");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(TestJudgments {
            test_id: record.test_id.clone(),
            job_id: record.job_id.clone(),
            trace_path: record.trace_path.clone(),
            per_rubric,
        })
    }
}
