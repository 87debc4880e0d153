//! CLI command definitions for agent-eval.
//!
//! Every command loads the [`EvaluatorConfig`] once (file, then environment
//! overrides, then validation) and prints its result as JSON on stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EvaluatorConfig;
use crate::jobs::{EvaluationRequest, JobManager, JobState};
use crate::metrics;
use crate::pipeline::{build_job_runner, EvaluationPipeline};
use crate::sandbox::SandboxExecutor;
use crate::suite::{load_suite, load_suite_dir, SuiteRunner, TestSuite};
use crate::trace::TraceWriter;

/// Default command used to start an agent inside its work directory.
const DEFAULT_AGENT_COMMAND: &str = "python agent_main.py";

/// How often `pipeline` polls its background job.
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Sandboxed agent evaluation: run agents, grade their traces, report scores.
#[derive(Parser)]
#[command(name = "agent-eval")]
#[command(about = "Run agent archives in a sandbox and grade them against rubric suites")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a YAML configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Print Prometheus metrics to stderr when the command finishes.
    #[arg(long, global = true)]
    pub print_metrics: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Stage, execute and trace a single agent archive.
    RunJob(RunJobArgs),

    /// Run every test of a suite (or a directory of suites) against an agent.
    RunSuite(RunSuiteArgs),

    /// Grade a raw-results bundle and write the report.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),

    /// Run a suite and grade it as one background job.
    Pipeline(RunSuiteArgs),

    /// Print the trace of a previous job.
    Trace(TraceArgs),

    /// Validate configuration and rubric templates, then print the effective config.
    CheckConfig,
}

/// Arguments for `agent-eval run-job`.
#[derive(Parser, Debug)]
pub struct RunJobArgs {
    /// Agent archive (.tar.gz, .tgz or .tar).
    #[arg(short, long)]
    pub archive: PathBuf,

    /// Command run inside the extracted archive.
    #[arg(long = "cmd", default_value = DEFAULT_AGENT_COMMAND)]
    pub command: String,

    /// Override the configured timeout in seconds.
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,
}

/// Arguments for `agent-eval run-suite` and `agent-eval pipeline`.
#[derive(Parser, Debug)]
pub struct RunSuiteArgs {
    /// Suite YAML file, or a directory of suite files (run-suite only).
    #[arg(short, long)]
    pub suite: PathBuf,

    /// Agent archive (.tar.gz, .tgz or .tar).
    #[arg(short, long)]
    pub archive: PathBuf,

    /// Command run inside the extracted archive.
    #[arg(long = "cmd", default_value = DEFAULT_AGENT_COMMAND)]
    pub command: String,
}

/// Arguments for `agent-eval evaluate`.
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Path to a `<run_id>_raw_results.json` bundle.
    #[arg(short, long)]
    pub data: PathBuf,
}

/// Arguments for `agent-eval trace`.
#[derive(Parser, Debug)]
pub struct TraceArgs {
    /// Job identifier printed by run-job or stored in a bundle.
    pub job_id: String,
}

#[derive(Debug, Serialize)]
struct RunJobOutput {
    job_id: String,
    trace_path: PathBuf,
    exit_code: i32,
    duration_seconds: f64,
}

#[derive(Debug, Serialize)]
struct RunSuiteOutput {
    suite: String,
    run_id: String,
    raw_results: PathBuf,
    tests: usize,
}

#[derive(Debug, Serialize)]
struct EvaluateOutput {
    run_id: String,
    total_score: f64,
    report_json: PathBuf,
    report_html: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and execute the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if cli.print_metrics {
        metrics::init_metrics().context("Failed to initialize metrics")?;
    }

    let config = EvaluatorConfig::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Commands::RunJob(args) => run_job_command(config, args).await?,
        Commands::RunSuite(args) => run_suite_command(config, args).await?,
        Commands::Evaluate(args) => run_evaluate_command(config, args).await?,
        Commands::Pipeline(args) => run_pipeline_command(config, args).await?,
        Commands::Trace(args) => run_trace_command(&config, args)?,
        Commands::CheckConfig => run_check_config_command(config)?,
    }

    if cli.print_metrics {
        eprint!("{}", metrics::export_metrics());
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Sandbox commands
// ============================================================================

async fn run_job_command(config: EvaluatorConfig, args: RunJobArgs) -> anyhow::Result<()> {
    let mut limits = config.sandbox.limits();
    if let Some(timeout) = args.timeout {
        limits.timeout_seconds = timeout;
    }

    let executor = Arc::new(SandboxExecutor::new(&config.sandbox));
    let runner = build_job_runner(&config, executor);
    let outcome = runner
        .run(&args.archive, &args.command, &limits, None)
        .await
        .context("Failed to persist trace")?;

    print_json(&RunJobOutput {
        job_id: outcome.job_id,
        trace_path: outcome.trace_path,
        exit_code: outcome.trace.exit_code,
        duration_seconds: outcome.trace.duration_seconds,
    })
}

async fn run_suite_command(config: EvaluatorConfig, args: RunSuiteArgs) -> anyhow::Result<()> {
    let suites: Vec<(PathBuf, TestSuite)> = if args.suite.is_dir() {
        load_suite_dir(&args.suite)?
    } else {
        vec![(args.suite.clone(), load_suite(&args.suite)?)]
    };
    if suites.is_empty() {
        anyhow::bail!("No suites found in {}", args.suite.display());
    }

    let executor = Arc::new(SandboxExecutor::new(&config.sandbox));
    let runner = SuiteRunner::new(
        Arc::new(build_job_runner(&config, executor)),
        &config.reports_dir,
        config.sandbox.limits(),
    );

    let mut outputs = Vec::with_capacity(suites.len());
    for (path, suite) in &suites {
        info!(suite = %suite.name, path = %path.display(), tests = suite.len(), "Running suite");
        let (raw_results, bundle) = runner
            .run_tracked(suite, &args.archive, &args.command, None)
            .await
            .with_context(|| format!("Suite '{}' failed", suite.name))?;
        outputs.push(RunSuiteOutput {
            suite: bundle.suite,
            run_id: bundle.run_id,
            raw_results,
            tests: bundle.tests.len(),
        });
    }
    print_json(&outputs)
}

fn run_trace_command(config: &EvaluatorConfig, args: TraceArgs) -> anyhow::Result<()> {
    let trace = TraceWriter::new(&config.data_dir)
        .load(&args.job_id)
        .with_context(|| format!("No trace for job {}", args.job_id))?;
    print_json(&trace)
}

// ============================================================================
// Grading commands
// ============================================================================

async fn run_evaluate_command(config: EvaluatorConfig, args: EvaluateArgs) -> anyhow::Result<()> {
    if !args.data.exists() {
        anyhow::bail!("Raw results file not found: {}", args.data.display());
    }

    let pipeline = EvaluationPipeline::from_config(config)?;
    let (report, paths) = pipeline
        .evaluate(&args.data)
        .await
        .with_context(|| format!("Failed to evaluate {}", args.data.display()))?;

    let stats = pipeline.evaluator().grader().cache_stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        hit_rate = stats.hit_rate(),
        "Judgment cache"
    );

    print_json(&EvaluateOutput {
        run_id: report.run_id,
        total_score: report.total_score,
        report_json: paths.json,
        report_html: paths.html,
    })
}

async fn run_pipeline_command(config: EvaluatorConfig, args: RunSuiteArgs) -> anyhow::Result<()> {
    if args.suite.is_dir() {
        anyhow::bail!("pipeline takes a single suite file, got a directory");
    }

    let pipeline = Arc::new(EvaluationPipeline::from_config(config)?);
    let manager = JobManager::new(pipeline);
    let handle = manager.submit(EvaluationRequest {
        suite_path: args.suite,
        agent_archive: args.archive,
        command: args.command,
    });
    info!(job = %handle.id, "Submitted evaluation job");

    let state = tokio::select! {
        state = manager.wait(handle.id, JOB_POLL_INTERVAL) => state,
        _ = tokio::signal::ctrl_c() => {
            warn!(job = %handle.id, "Interrupted, cancelling job");
            Some(manager.cancel(handle.id).await?)
        }
    };

    match state {
        Some(state @ JobState::Completed { .. }) => print_json(&state),
        Some(JobState::Failed { error }) => Err(anyhow::anyhow!("Evaluation failed: {error}")),
        Some(other) => {
            print_json(&other)?;
            anyhow::bail!("Evaluation {other}")
        }
        None => anyhow::bail!("Job {} disappeared", handle.id),
    }
}

fn run_check_config_command(config: EvaluatorConfig) -> anyhow::Result<()> {
    let weights = config.rubric_weights()?;
    let missing: Vec<String> = weights
        .rubrics()
        .map(|rubric| template_path(&config.prompts_dir, rubric))
        .filter(|path| !path.is_file())
        .map(|path| path.display().to_string())
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("Missing rubric templates: {}", missing.join(", "));
    }

    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn template_path(prompts_dir: &Path, rubric: &str) -> PathBuf {
    prompts_dir.join(format!("{rubric}.txt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_job_defaults() {
        let cli = Cli::try_parse_from(["agent-eval", "run-job", "--archive", "a.tar.gz"]).unwrap();
        match cli.command {
            Commands::RunJob(args) => {
                assert_eq!(args.command, DEFAULT_AGENT_COMMAND);
                assert_eq!(args.archive, PathBuf::from("a.tar.gz"));
                assert!(args.timeout.is_none());
            }
            _ => panic!("expected run-job"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_job_rejects_zero_timeout() {
        let parsed = Cli::try_parse_from([
            "agent-eval", "run-job", "--archive", "a.tar.gz", "--timeout", "0",
        ]);
        assert!(parsed.is_err());

        let cli = Cli::try_parse_from([
            "agent-eval", "run-job", "--archive", "a.tar.gz", "--timeout", "3",
        ])
        .unwrap();
        match cli.command {
            Commands::RunJob(args) => assert_eq!(args.timeout, Some(3)),
            _ => panic!("expected run-job"),
        }
    }

    #[test]
    fn test_parse_evaluate_alias_and_globals() {
        let cli = Cli::try_parse_from([
            "agent-eval",
            "eval",
            "--data",
            "r_raw_results.json",
            "--config",
            "eval.yaml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Evaluate(_)));
        assert_eq!(cli.config, Some(PathBuf::from("eval.yaml")));
        assert_eq!(cli.log_level, "debug");
    }
}
