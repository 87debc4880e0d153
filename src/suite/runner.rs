//! Suite runner: one sandbox job per test case, collected into a bundle.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Expectation, TestSuite};
use crate::error::{ReportError, SuiteError};
use crate::sandbox::{ActiveUnit, JobRunner, ResourceLimits};
use crate::trace::{Trace, TraceWriter};
use crate::utils::json::schema_version;

/// Current raw results bundle schema version.
pub const BUNDLE_SCHEMA_VERSION: u64 = 1;

/// Environment variable carrying the test prompt to the agent.
pub const PROMPT_ENV: &str = "AGENT_PROMPT";

/// Environment variable carrying the test id to the agent.
pub const TEST_ID_ENV: &str = "AGENT_TEST_ID";

/// Per-test entry of a raw results bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub test_id: String,
    pub prompt: String,
    pub rubric: String,
    pub expectation: Expectation,
    /// Absent only if the job could not persist its trace.
    pub job_id: Option<String>,
    pub trace_path: Option<PathBuf>,
    /// `None` when the trace could not be read back.
    pub trace: Option<Trace>,
    /// Seconds from just before invocation to trace availability.
    pub duration_seconds: f64,
}

/// Output of one suite run, consumed by the grading stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResultsBundle {
    pub schema_version: u64,
    pub run_id: String,
    pub suite: String,
    pub agent_archive: PathBuf,
    pub command: String,
    pub created_at: DateTime<Utc>,
    pub tests: Vec<TestRecord>,
}

impl RawResultsBundle {
    /// File name of the bundle for a run.
    pub fn file_name(run_id: &str) -> String {
        format!("{run_id}_raw_results.json")
    }

    /// Reads a bundle, rejecting unknown schema versions.
    pub fn read(path: &Path) -> Result<Self, ReportError> {
        if !path.exists() {
            return Err(ReportError::BundleNotFound(path.to_path_buf()));
        }
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        match schema_version(&value) {
            BUNDLE_SCHEMA_VERSION => Ok(serde_json::from_value(value)?),
            version => Err(ReportError::UnsupportedSchema {
                artifact: "raw results bundle",
                version,
            }),
        }
    }

    /// Writes the bundle atomically into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, SuiteError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(&self.run_id));
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| SuiteError::Io(e.error))?;
        Ok(path)
    }
}

/// Runs every test of a suite sequentially against one agent archive.
pub struct SuiteRunner {
    jobs: Arc<JobRunner>,
    output_dir: PathBuf,
    limits: ResourceLimits,
}

impl SuiteRunner {
    /// Creates a runner writing bundles to `output_dir`.
    pub fn new(jobs: Arc<JobRunner>, output_dir: impl Into<PathBuf>, limits: ResourceLimits) -> Self {
        Self {
            jobs,
            output_dir: output_dir.into(),
            limits,
        }
    }

    /// Runs the suite and returns the path of the written bundle.
    pub async fn run(
        &self,
        suite: &TestSuite,
        archive: &Path,
        command: &str,
    ) -> Result<PathBuf, SuiteError> {
        let (path, _) = self.run_tracked(suite, archive, command, None).await?;
        Ok(path)
    }

    /// Runs the suite, publishing the in-flight unit to `active` so the
    /// run can be cancelled from outside.
    ///
    /// The same archive and command are used for every test. A missing
    /// archive fails the whole run up front; failures of individual tests
    /// are recorded and never abort the remaining ones.
    pub async fn run_tracked(
        &self,
        suite: &TestSuite,
        archive: &Path,
        command: &str,
        active: Option<&ActiveUnit>,
    ) -> Result<(PathBuf, RawResultsBundle), SuiteError> {
        if !archive.exists() {
            return Err(SuiteError::ArchiveNotFound(archive.to_path_buf()));
        }

        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, suite = %suite.name, tests = suite.len(), "Starting suite run");

        let mut records = Vec::with_capacity(suite.len());
        for case in &suite.tests {
            let start = Instant::now();
            let env = vec![
                (PROMPT_ENV.to_string(), case.prompt.clone()),
                (TEST_ID_ENV.to_string(), case.id.clone()),
            ];
            let outcome = self
                .jobs
                .run_with_env(archive, command, &self.limits, env, active)
                .await;

            let (job_id, trace_path, trace) = match outcome {
                Ok(outcome) => {
                    let trace = match TraceWriter::read(&outcome.trace_path) {
                        Ok(trace) => Some(trace),
                        Err(e) => {
                            warn!(test_id = %case.id, error = %e, "Failed to read trace");
                            None
                        }
                    };
                    (Some(outcome.job_id), Some(outcome.trace_path), trace)
                }
                Err(e) => {
                    warn!(test_id = %case.id, error = %e, "Sandbox job failed to produce a trace");
                    (None, None, None)
                }
            };

            records.push(TestRecord {
                test_id: case.id.clone(),
                prompt: case.prompt.clone(),
                rubric: case.rubric.clone(),
                expectation: case.expectation(),
                job_id,
                trace_path,
                trace,
                duration_seconds: start.elapsed().as_secs_f64(),
            });
        }

        let bundle = RawResultsBundle {
            schema_version: BUNDLE_SCHEMA_VERSION,
            run_id,
            suite: suite.name.clone(),
            agent_archive: std::path::absolute(archive).unwrap_or_else(|_| archive.to_path_buf()),
            command: command.to_string(),
            created_at: Utc::now(),
            tests: records,
        };
        let path = bundle.write(&self.output_dir)?;

        info!(run_id = %bundle.run_id, path = %path.display(), "Suite run complete");
        Ok((path, bundle))
    }
}
