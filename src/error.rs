//! Error types for agent evaluation operations.
//!
//! Defines error types for every pipeline stage:
//! - Archive staging
//! - Sandbox runtime access
//! - Trace persistence
//! - Suite loading and execution
//! - LLM judge interactions
//! - Grading and judgment caching
//! - Configuration validation
//! - Report generation
//! - End-to-end pipeline and background jobs
//!
//! Failures that happen *inside* a sandboxed run are not represented here:
//! the executor folds them into an `ExecutionResult` with a reserved exit code.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while staging an agent archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Agent archive not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to extract archive '{path}': {reason}")]
    ExtractionFailed { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by an isolation runtime.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Isolation runtime unavailable: {0}")]
    IsolationUnavailable(String),

    #[error("Isolation runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while writing or reading traces.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Trace for job '{0}' not found")]
    NotFound(String),

    #[error("Invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("Unsupported trace schema version {0}")]
    UnsupportedSchema(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading or running a test suite.
#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("Suite file not found: {0}")]
    NotFound(PathBuf),

    #[error("Agent archive not found: {0}")]
    ArchiveNotFound(PathBuf),

    #[error("Failed to parse suite '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Suite '{0}' contains no test cases")]
    Empty(String),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Judge request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
}

/// Errors that can occur while grading.
#[derive(Debug, Error)]
pub enum GraderError {
    #[error("Prompt template for rubric '{rubric}' not found at {path}")]
    TemplateMissing { rubric: String, path: PathBuf },

    #[error("Rubric '{0}' has no loaded template")]
    UnknownRubric(String),

    #[error("Judgment cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid rubric weights: {0}")]
    InvalidWeights(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse config '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while producing reports.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Raw results bundle not found: {0}")]
    BundleNotFound(PathBuf),

    #[error("Unsupported {artifact} schema version {version}")]
    UnsupportedSchema { artifact: &'static str, version: u64 },

    #[error("Grading error: {0}")]
    Grader(#[from] GraderError),

    #[error("Report rendering failed: {0}")]
    Render(#[from] tera::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the end-to-end pipeline and background jobs.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Judge setup failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Grader setup failed: {0}")]
    Grader(#[from] GraderError),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("Suite error: {0}")]
    Suite(#[from] SuiteError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Job not found: {0}")]
    JobNotFound(String),
}
