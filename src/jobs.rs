//! Background evaluation jobs.
//!
//! [`JobManager::submit`] returns a [`JobHandle`] immediately and runs the
//! full pipeline on its own tokio task. Callers poll [`JobManager::status`]
//! and may [`JobManager::cancel`], which aborts the task and kills the
//! sandbox unit in flight.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::metrics;
use crate::pipeline::EvaluationPipeline;
use crate::sandbox::ActiveUnit;
use crate::suite::load_suite;

/// Finished jobs kept for status queries before the oldest are evicted.
/// Queued and running jobs are never evicted.
pub const RETAINED_JOBS: usize = 256;

/// What to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub suite_path: PathBuf,
    pub agent_archive: PathBuf,
    pub command: String,
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        run_id: String,
        raw_results: PathBuf,
        report_json: PathBuf,
        report_html: PathBuf,
        total_score: f64,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl JobState {
    /// Returns true once the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Completed { .. } => write!(f, "completed"),
            JobState::Failed { .. } => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Returned by [`JobManager::submit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub submitted_at: DateTime<Utc>,
}

struct JobEntry {
    state: JobState,
    active: ActiveUnit,
    task: Option<JoinHandle<()>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobEntry {
    fn finish(&mut self, state: JobState) {
        self.state = state;
        if self.state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }
}

type JobTable = Arc<Mutex<HashMap<Uuid, JobEntry>>>;

/// Decrements the in-progress gauge when a job task ends or is aborted.
struct InProgress;

impl InProgress {
    fn start() -> Self {
        metrics::job_started();
        Self
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        metrics::job_finished();
    }
}

/// Runs evaluation requests in the background.
pub struct JobManager {
    pipeline: Arc<EvaluationPipeline>,
    jobs: JobTable,
}

impl JobManager {
    pub fn new(pipeline: Arc<EvaluationPipeline>) -> Self {
        Self {
            pipeline,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queues a request and returns without waiting for it.
    pub fn submit(&self, request: EvaluationRequest) -> JobHandle {
        let handle = JobHandle {
            id: Uuid::new_v4(),
            submitted_at: Utc::now(),
        };
        let active = ActiveUnit::new();

        {
            let mut jobs = lock(&self.jobs);
            evict_finished(&mut jobs, RETAINED_JOBS);
            jobs.insert(
                handle.id,
                JobEntry {
                    state: JobState::Queued,
                    active: active.clone(),
                    task: None,
                    finished_at: None,
                },
            );
        }

        let pipeline = self.pipeline.clone();
        let jobs = self.jobs.clone();
        let id = handle.id;
        let task = tokio::spawn(async move {
            if !transition(&jobs, id, JobState::Running) {
                return;
            }
            let _in_progress = InProgress::start();
            info!(job = %id, suite = %request.suite_path.display(), "Job started");

            let state = match run_request(&pipeline, &request, &active).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(job = %id, error = %e, "Job failed");
                    JobState::Failed {
                        error: e.to_string(),
                    }
                }
            };
            info!(job = %id, state = %state, "Job finished");
            transition(&jobs, id, state);
        });

        if let Some(entry) = lock(&self.jobs).get_mut(&handle.id) {
            entry.task = Some(task);
        }
        handle
    }

    /// Current state of a job, or `None` for an unknown id.
    pub fn status(&self, id: Uuid) -> Option<JobState> {
        lock(&self.jobs).get(&id).map(|entry| entry.state.clone())
    }

    /// Cancels a job. Terminal jobs are left untouched.
    ///
    /// # Errors
    ///
    /// `PipelineError::JobNotFound` for an unknown id.
    pub async fn cancel(&self, id: Uuid) -> Result<JobState, PipelineError> {
        let unit = {
            let mut jobs = lock(&self.jobs);
            let entry = jobs
                .get_mut(&id)
                .ok_or_else(|| PipelineError::JobNotFound(id.to_string()))?;
            if entry.state.is_terminal() {
                return Ok(entry.state.clone());
            }
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            entry.finish(JobState::Cancelled);
            entry.active.current()
        };

        if let Some(unit) = unit {
            self.pipeline.executor().kill(&unit).await;
        }
        info!(job = %id, "Job cancelled");
        Ok(JobState::Cancelled)
    }

    /// Polls until the job reaches a terminal state.
    pub async fn wait(&self, id: Uuid, poll_interval: Duration) -> Option<JobState> {
        loop {
            let state = self.status(id)?;
            if state.is_terminal() {
                return Some(state);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Ids and states of every known job.
    pub fn list(&self) -> Vec<(Uuid, JobState)> {
        lock(&self.jobs)
            .iter()
            .map(|(id, entry)| (*id, entry.state.clone()))
            .collect()
    }
}

async fn run_request(
    pipeline: &EvaluationPipeline,
    request: &EvaluationRequest,
    active: &ActiveUnit,
) -> Result<JobState, PipelineError> {
    let suite = load_suite(&request.suite_path)?;
    let outcome = pipeline
        .run(&suite, &request.agent_archive, &request.command, Some(active))
        .await?;
    Ok(JobState::Completed {
        run_id: outcome.run_id,
        raw_results: outcome.raw_results,
        report_json: outcome.report.json,
        report_html: outcome.report.html,
        total_score: outcome.total_score,
    })
}

fn lock(jobs: &JobTable) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobEntry>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

/// Moves a job to `state` unless it was already cancelled. Returns whether
/// the transition happened.
fn transition(jobs: &JobTable, id: Uuid, state: JobState) -> bool {
    match lock(jobs).get_mut(&id) {
        Some(entry) if entry.state != JobState::Cancelled => {
            entry.finish(state);
            true
        }
        _ => false,
    }
}

/// Drops the oldest finished jobs until at most `keep` remain.
fn evict_finished(jobs: &mut HashMap<Uuid, JobEntry>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .iter()
        .filter_map(|(id, entry)| entry.finished_at.map(|at| (at, *id)))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}
