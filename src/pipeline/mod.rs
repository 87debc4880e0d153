//! End-to-end evaluation pipeline.
//!
//! Suite Runner → Sandbox Executor → Trace Writer → raw-results bundle →
//! Grader Engine → Report Aggregator → persisted report.
//!
//! ```rust,ignore
//! use agent_evaluator::config::EvaluatorConfig;
//! use agent_evaluator::pipeline::EvaluationPipeline;
//! use agent_evaluator::suite::load_suite;
//!
//! let config = EvaluatorConfig::load(None)?;
//! let pipeline = EvaluationPipeline::from_config(config)?;
//! let suite = load_suite(Path::new("suites/home.yaml"))?;
//! let outcome = pipeline
//!     .run(&suite, Path::new("agent.tar.gz"), "python agent_main.py", None)
//!     .await?;
//! println!("{}: {}/100", outcome.run_id, outcome.total_score);
//! ```

pub mod evaluator;
pub mod orchestrator;

pub use evaluator::{Evaluator, TOOL_USAGE_RUBRIC};
pub use orchestrator::{build_job_runner, EvaluationPipeline, PipelineOutcome};
