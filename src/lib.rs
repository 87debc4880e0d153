//! agent-evaluator: sandboxed execution and rubric grading of agent programs.
//!
//! An agent archive is staged into a work directory, executed under CPU,
//! memory, network and time limits, and its behaviour captured as a trace.
//! Traces from a test suite are bundled, graded per rubric by a judge
//! (with a content-addressed judgment cache) and folded into a weighted
//! 0-100 composite score with JSON and HTML reports.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod grader;
pub mod jobs;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod report;
pub mod sandbox;
pub mod suite;
pub mod trace;
pub mod utils;

// Re-export commonly used types
pub use config::{EvaluatorConfig, RubricWeights};
pub use error::{
    ArchiveError, ConfigError, GraderError, LlmError, PipelineError, ReportError, SandboxError,
    SuiteError, TraceError,
};
pub use pipeline::{EvaluationPipeline, PipelineOutcome};
