//! Report persistence keyed by run id.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::info;

use super::{render_html, EvaluationReport, REPORT_SCHEMA_VERSION};
use crate::error::ReportError;
use crate::utils::json::schema_version;

/// Locations of a written report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportPaths {
    pub json: PathBuf,
    pub html: PathBuf,
}

/// Writes `<run_id>_report.json` and `<run_id>_report.html` into a directory.
///
/// A second report for the same run id replaces the first.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths_for(&self, run_id: &str) -> ReportPaths {
        ReportPaths {
            json: self.dir.join(format!("{run_id}_report.json")),
            html: self.dir.join(format!("{run_id}_report.html")),
        }
    }

    pub fn write(&self, report: &EvaluationReport) -> Result<ReportPaths, ReportError> {
        fs::create_dir_all(&self.dir)?;
        let paths = self.paths_for(&report.run_id);

        let json = serde_json::to_vec_pretty(report)?;
        self.replace(&paths.json, &json)?;
        let html = render_html(report)?;
        self.replace(&paths.html, html.as_bytes())?;

        info!(
            run_id = %report.run_id,
            total_score = report.total_score,
            json = %paths.json.display(),
            "Wrote report"
        );
        Ok(paths)
    }

    fn replace(&self, path: &Path, content: &[u8]) -> Result<(), ReportError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| ReportError::Io(e.error))?;
        Ok(())
    }

    /// Reads a JSON report, rejecting unknown schema versions.
    pub fn read(path: &Path) -> Result<EvaluationReport, ReportError> {
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        match schema_version(&value) {
            REPORT_SCHEMA_VERSION => Ok(serde_json::from_value(value)?),
            version => Err(ReportError::UnsupportedSchema {
                artifact: "evaluation report",
                version,
            }),
        }
    }
}
