//! Sandbox job lifecycle: stage, execute, trace, reclaim.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use super::executor::{exit_codes, ExecutionResult, SandboxExecutor};
use super::resources::ResourceLimits;
use super::stager::ArchiveStager;
use crate::error::{ArchiveError, TraceError};
use crate::trace::{Trace, TraceWriter};

/// One execution attempt of an agent archive.
#[derive(Debug, Clone)]
pub struct SandboxJob {
    pub job_id: String,
    pub archive_path: PathBuf,
    pub command: String,
    pub limits: ResourceLimits,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Result of running a job: where its trace was written and the trace itself.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub trace_path: PathBuf,
    pub trace: Trace,
}

/// Shared slot holding the unit name of the execution currently in flight,
/// so a canceller can kill it.
#[derive(Debug, Clone, Default)]
pub struct ActiveUnit(Arc<Mutex<Option<String>>>);

impl ActiveUnit {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, unit: Option<String>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = unit;
    }

    /// Unit name of the running execution, if any.
    pub fn current(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Runs single sandbox jobs end to end.
pub struct JobRunner {
    stager: ArchiveStager,
    executor: Arc<SandboxExecutor>,
    writer: TraceWriter,
    keep_workdir: bool,
}

impl JobRunner {
    pub fn new(stager: ArchiveStager, executor: Arc<SandboxExecutor>, writer: TraceWriter) -> Self {
        Self {
            stager,
            executor,
            writer,
            keep_workdir: false,
        }
    }

    /// Keeps work directories after the trace is written.
    pub fn with_keep_workdir(mut self, keep: bool) -> Self {
        self.keep_workdir = keep;
        self
    }

    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        &self.executor
    }

    pub fn writer(&self) -> &TraceWriter {
        &self.writer
    }

    /// Stages `archive`, runs `command` against it and writes the trace.
    ///
    /// Staging failures do not abort: they are recorded in the trace with
    /// exit code `-5` (archive missing) or `-3` (extraction failed). Only a
    /// failure to persist the trace is returned as an error.
    pub async fn run(
        &self,
        archive: &Path,
        command: &str,
        limits: &ResourceLimits,
        active: Option<&ActiveUnit>,
    ) -> Result<JobOutcome, TraceError> {
        self.run_with_env(archive, command, limits, Vec::new(), active)
            .await
    }

    /// Like [`JobRunner::run`], passing `env` to the agent process.
    pub async fn run_with_env(
        &self,
        archive: &Path,
        command: &str,
        limits: &ResourceLimits,
        env: Vec<(String, String)>,
        active: Option<&ActiveUnit>,
    ) -> Result<JobOutcome, TraceError> {
        let job_id = Uuid::new_v4().to_string();
        let job = SandboxJob {
            workdir: self.stager.workdir_for(&job_id),
            job_id,
            archive_path: archive.to_path_buf(),
            command: command.to_string(),
            limits: limits.clone(),
            env,
        };
        info!(job_id = %job.job_id, archive = %archive.display(), "Starting sandbox job");

        let start = Instant::now();
        let staged = self
            .stager
            .prepare(&job.job_id)
            .and_then(|workdir| self.stager.extract(&job.archive_path, &workdir));

        let trace = match staged {
            Ok(()) => {
                if let Some(active) = active {
                    active.set(Some(SandboxExecutor::unit_name(&job.job_id)));
                }
                let result = self
                    .executor
                    .execute_with_env(
                        &job.job_id,
                        &job.workdir,
                        &job.command,
                        &job.limits,
                        &job.env,
                    )
                    .await;
                if let Some(active) = active {
                    active.set(None);
                }
                self.trace_for(&job, &result)
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Staging failed");
                let exit_code = match e {
                    ArchiveError::NotFound(_) => exit_codes::ARCHIVE_MISSING,
                    _ => exit_codes::EXTRACTION_FAILED,
                };
                let message = format!("extract failed: {e}");
                let result = ExecutionResult::failed(exit_code, message.clone(), start.elapsed());
                self.trace_for(&job, &result).with_error(message)
            }
        };

        let trace_path = self.writer.persist(&trace)?;
        self.reclaim(&job);

        Ok(JobOutcome {
            job_id: job.job_id,
            trace_path,
            trace,
        })
    }

    fn trace_for(&self, job: &SandboxJob, result: &ExecutionResult) -> Trace {
        Trace::from_execution(
            job.job_id.clone(),
            absolute(&job.archive_path),
            job.command.clone(),
            result,
            job.workdir.clone(),
        )
    }

    /// Best-effort removal of the job's work directory.
    fn reclaim(&self, job: &SandboxJob) {
        if self.keep_workdir || !job.workdir.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&job.workdir) {
            warn!(job_id = %job.job_id, error = %e, "Failed to reclaim work directory");
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
