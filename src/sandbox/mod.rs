//! Sandboxed execution of agent archives.
//!
//! - [`stager`]: extracts archives into per-job work directories
//! - [`runtime`]: isolation runtimes (Docker, unconfined local fallback)
//! - [`executor`]: runs a command with limits, folding failures into results
//! - [`job`]: full job lifecycle producing a persisted trace

pub mod executor;
pub mod job;
pub mod resources;
pub mod runtime;
pub mod stager;

pub use executor::{exit_codes, ExecutionResult, SandboxExecutor};
pub use job::{ActiveUnit, JobOutcome, JobRunner, SandboxJob};
pub use resources::ResourceLimits;
pub use runtime::{DockerRuntime, IsolationInfo, IsolationRuntime, LocalRuntime};
pub use stager::{ArchiveFormat, ArchiveStager};
