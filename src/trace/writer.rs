//! Trace persistence keyed by job id.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{Trace, TRACE_SCHEMA_VERSION};
use crate::error::TraceError;
use crate::sandbox::ExecutionResult;
use crate::utils::json::schema_version;

/// Writes and reads `<job_id>_trace.json` documents in a directory.
#[derive(Debug, Clone)]
pub struct TraceWriter {
    dir: PathBuf,
}

impl TraceWriter {
    /// Creates a writer for `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory traces are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the trace for a job.
    ///
    /// Job ids are limited to ASCII letters, digits, `-` and `_`, so the
    /// path always stays inside the trace directory.
    pub fn path_for(&self, job_id: &str) -> Result<PathBuf, TraceError> {
        let valid = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(TraceError::InvalidJobId(job_id.to_string()));
        }
        Ok(self.dir.join(format!("{job_id}_trace.json")))
    }

    /// Builds a trace from an execution result and persists it.
    pub fn write(
        &self,
        job_id: &str,
        archive_path: &Path,
        command: &str,
        result: &ExecutionResult,
        workdir: &Path,
    ) -> Result<PathBuf, TraceError> {
        let trace = Trace::from_execution(job_id, archive_path, command, result, workdir);
        self.persist(&trace)
    }

    /// Persists a trace atomically, replacing any previous trace for the job.
    pub fn persist(&self, trace: &Trace) -> Result<PathBuf, TraceError> {
        let path = self.path_for(&trace.job_id)?;
        fs::create_dir_all(&self.dir)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, trace)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| TraceError::Io(e.error))?;

        info!(
            job_id = %trace.job_id,
            exit_code = trace.exit_code,
            tool_calls = trace.tool_calls.len(),
            path = %path.display(),
            "Wrote trace"
        );
        Ok(path)
    }

    /// Loads the trace for `job_id`.
    pub fn load(&self, job_id: &str) -> Result<Trace, TraceError> {
        let path = self.path_for(job_id)?;
        if !path.exists() {
            return Err(TraceError::NotFound(job_id.to_string()));
        }
        Self::read(&path)
    }

    /// Reads a trace document from an arbitrary path.
    pub fn read(path: &Path) -> Result<Trace, TraceError> {
        let content = fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&content)?;

        match schema_version(&value) {
            TRACE_SCHEMA_VERSION => {
                debug!(path = %path.display(), "Loaded trace");
                Ok(serde_json::from_value(value)?)
            }
            other => Err(TraceError::UnsupportedSchema(other)),
        }
    }
}
