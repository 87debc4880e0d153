//! Prometheus metrics for the evaluation pipeline.
//!
//! ```ignore
//! use agent_evaluator::metrics::{export_metrics, init_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run evaluations ...
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{
    job_finished, job_started, record_cache_lookup, record_composite_score,
    record_judge_request, record_sandbox_execution,
};
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
