//! Wiring of every pipeline stage from one [`EvaluatorConfig`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::evaluator::Evaluator;
use crate::config::EvaluatorConfig;
use crate::error::{PipelineError, ReportError, SuiteError, TraceError};
use crate::grader::{build_judge, GraderEngine, Judge, JudgmentCache, TemplateStore};
use crate::report::{EvaluationReport, ReportPaths, ReportWriter};
use crate::sandbox::{ActiveUnit, ArchiveStager, JobOutcome, JobRunner, SandboxExecutor};
use crate::suite::{RawResultsBundle, SuiteRunner, TestSuite};
use crate::trace::{Trace, TraceWriter};

/// Artifacts of one end-to-end run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub raw_results: PathBuf,
    pub report: ReportPaths,
    pub total_score: f64,
}

/// Builds the stage → execute → trace runner for `config`.
///
/// Needs no judge, so sandbox-only commands can use it without an endpoint.
pub fn build_job_runner(config: &EvaluatorConfig, executor: Arc<SandboxExecutor>) -> JobRunner {
    JobRunner::new(
        ArchiveStager::new(config.work_dir()),
        executor,
        TraceWriter::new(&config.data_dir),
    )
    .with_keep_workdir(config.sandbox.keep_workdir)
}

/// Every stage of the evaluation pipeline, built once from configuration.
pub struct EvaluationPipeline {
    config: EvaluatorConfig,
    jobs: Arc<JobRunner>,
    suites: SuiteRunner,
    evaluator: Evaluator,
}

impl EvaluationPipeline {
    /// Builds the pipeline, connecting to the isolation runtime and judge
    /// configured in `config`.
    ///
    /// # Errors
    ///
    /// Fails on invalid weights, a missing rubric template, an unusable
    /// judge configuration or an uncreatable cache directory.
    pub fn from_config(config: EvaluatorConfig) -> Result<Self, PipelineError> {
        let executor = Arc::new(SandboxExecutor::new(&config.sandbox));
        let judge = build_judge(&config.judge)?;
        Self::from_parts(config, executor, judge)
    }

    /// Builds the pipeline around an existing executor and judge.
    pub fn from_parts(
        config: EvaluatorConfig,
        executor: Arc<SandboxExecutor>,
        judge: Arc<dyn Judge>,
    ) -> Result<Self, PipelineError> {
        let weights = config.rubric_weights()?;

        let jobs = Arc::new(build_job_runner(&config, executor));
        let suites = SuiteRunner::new(
            jobs.clone(),
            &config.reports_dir,
            config.sandbox.limits(),
        );

        let templates = TemplateStore::load(&config.prompts_dir, weights.rubrics())?;
        let cache = JudgmentCache::open(&config.cache_dir)?;
        info!(
            rubrics = templates.len(),
            judge = judge.name(),
            cache = %config.cache_dir.display(),
            "Grader ready"
        );

        let evaluator = Evaluator::new(
            Arc::new(GraderEngine::new(templates, judge, cache)),
            weights,
            config.judge.score_max,
            ReportWriter::new(&config.reports_dir),
        )
        .with_all_rubrics(config.grading.all_rubrics);

        Ok(Self {
            config,
            jobs,
            suites,
            evaluator,
        })
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        self.jobs.executor()
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Stages, executes and traces a single archive.
    pub async fn run_job(
        &self,
        archive: &Path,
        command: &str,
        active: Option<&ActiveUnit>,
    ) -> Result<JobOutcome, TraceError> {
        self.jobs
            .run(archive, command, &self.config.sandbox.limits(), active)
            .await
    }

    /// Loads a previously written trace.
    pub fn trace(&self, job_id: &str) -> Result<Trace, TraceError> {
        self.jobs.writer().load(job_id)
    }

    /// Runs a suite and writes its raw-results bundle.
    pub async fn run_suite(
        &self,
        suite: &TestSuite,
        archive: &Path,
        command: &str,
        active: Option<&ActiveUnit>,
    ) -> Result<(PathBuf, RawResultsBundle), SuiteError> {
        self.suites.run_tracked(suite, archive, command, active).await
    }

    /// Grades a raw-results bundle and writes its report.
    pub async fn evaluate(
        &self,
        bundle: &Path,
    ) -> Result<(EvaluationReport, ReportPaths), ReportError> {
        self.evaluator.evaluate_bundle(bundle).await
    }

    /// Runs a suite, grades it and writes the report.
    pub async fn run(
        &self,
        suite: &TestSuite,
        archive: &Path,
        command: &str,
        active: Option<&ActiveUnit>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let (raw_results, bundle) = self.run_suite(suite, archive, command, active).await?;
        let report = self.evaluator.evaluate(&bundle).await?;
        let paths = self.evaluator.reports().write(&report)?;

        Ok(PipelineOutcome {
            run_id: report.run_id,
            raw_results,
            report: paths,
            total_score: report.total_score,
        })
    }
}
