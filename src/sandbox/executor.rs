//! Sandbox executor.
//!
//! Runs a command against a staged work directory, preferring the isolated
//! runtime and falling back to unconfined local execution when it is not
//! reachable. The executor never fails: every failure mode is folded into an
//! [`ExecutionResult`] carrying one of the reserved [`exit_codes`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::resources::ResourceLimits;
use super::runtime::{
    DockerRuntime, Invocation, IsolationInfo, IsolationRuntime, LocalRuntime, Termination,
};
use crate::config::{IsolationMode, SandboxSettings};
use crate::metrics;

/// Reserved exit codes for failures that happen outside the agent process.
pub mod exit_codes {
    /// Wall-clock limit exceeded; the unit was killed.
    pub const TIMEOUT: i32 = -1;
    /// The isolation runtime raised an unexpected error.
    pub const RUNTIME_FAULT: i32 = -2;
    /// The archive could not be extracted.
    pub const EXTRACTION_FAILED: i32 = -3;
    /// The command's entry file is not present in the work directory.
    pub const ENTRY_MISSING: i32 = -4;
    /// The archive does not exist.
    pub const ARCHIVE_MISSING: i32 = -5;
}

/// Maximum number of directory entries listed in an entry-missing diagnostic.
const MAX_LISTED_ENTRIES: usize = 20;

/// Slack on top of the job timeout before the executor abandons a runtime
/// that failed to enforce the limit itself.
const RUNTIME_GRACE: Duration = Duration::from_secs(5);

/// File extensions recognised as entry scripts.
const ENTRY_EXTENSIONS: &[&str] = &[".py", ".sh", ".js", ".rb", ".pl"];

/// Outcome of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Process exit code, or a negative reserved code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration in seconds (millisecond precision).
    pub duration_seconds: f64,
    /// Isolation applied; `None` for unconfined execution.
    pub isolation: Option<IsolationInfo>,
}

impl ExecutionResult {
    /// Builds a result that failed before any process was started.
    pub fn failed(exit_code: i32, stderr: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_seconds: round_millis(duration),
            isolation: None,
        }
    }

    /// Returns true if the run exceeded its wall-clock limit.
    pub fn timed_out(&self) -> bool {
        self.exit_code == exit_codes::TIMEOUT
    }

    /// Label used for metrics and logs.
    pub fn outcome(&self) -> &'static str {
        match self.exit_code {
            0 => "success",
            exit_codes::TIMEOUT => "timeout",
            exit_codes::RUNTIME_FAULT => "runtime_fault",
            exit_codes::EXTRACTION_FAILED => "extraction_failed",
            exit_codes::ENTRY_MISSING => "entry_missing",
            exit_codes::ARCHIVE_MISSING => "archive_missing",
            _ => "nonzero_exit",
        }
    }
}

/// Executes commands in the best available runtime.
pub struct SandboxExecutor {
    isolated: Option<Arc<dyn IsolationRuntime>>,
    fallback: Arc<dyn IsolationRuntime>,
    validate_entry: bool,
    grace: Duration,
}

impl SandboxExecutor {
    /// Creates an executor from sandbox settings.
    ///
    /// With `isolation: auto` a Docker client is created; whether the daemon
    /// is actually reachable is checked on every execution.
    pub fn new(settings: &SandboxSettings) -> Self {
        let isolated: Option<Arc<dyn IsolationRuntime>> = match settings.isolation {
            IsolationMode::Auto => match DockerRuntime::connect(settings.image.clone()) {
                Ok(runtime) => Some(Arc::new(runtime)),
                Err(e) => {
                    warn!(error = %e, "Docker client unavailable, sandbox will run unconfined");
                    None
                }
            },
            IsolationMode::None => None,
        };

        Self {
            isolated,
            fallback: Arc::new(LocalRuntime::new()),
            validate_entry: settings.validate_entry,
            grace: RUNTIME_GRACE,
        }
    }

    /// Creates an executor with explicit runtimes.
    pub fn with_runtimes(
        isolated: Option<Arc<dyn IsolationRuntime>>,
        fallback: Arc<dyn IsolationRuntime>,
    ) -> Self {
        Self {
            isolated,
            fallback,
            validate_entry: true,
            grace: RUNTIME_GRACE,
        }
    }

    /// Overrides the slack granted to a runtime past the job timeout.
    pub fn with_runtime_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Enables or disables the entry-file pre-check.
    pub fn with_entry_validation(mut self, enabled: bool) -> Self {
        self.validate_entry = enabled;
        self
    }

    /// Unit name for a job, unique per job id.
    pub fn unit_name(job_id: &str) -> String {
        format!("nle_sandbox_{job_id}")
    }

    /// Picks the isolated runtime when reachable, otherwise the fallback.
    async fn select_runtime(&self) -> Arc<dyn IsolationRuntime> {
        if let Some(runtime) = &self.isolated {
            if runtime.is_available().await {
                return Arc::clone(runtime);
            }
            warn!(
                runtime = runtime.kind(),
                "Isolation runtime unavailable, falling back to unconfined execution"
            );
        }
        Arc::clone(&self.fallback)
    }

    /// Runs `command` against `workdir` under `limits`.
    ///
    /// Always returns exactly one result. Timeouts yield exit code `-1` with
    /// `TIMEOUT after <n>s` appended to stderr and whatever output was
    /// captured before the kill.
    pub async fn execute(
        &self,
        job_id: &str,
        workdir: &Path,
        command: &str,
        limits: &ResourceLimits,
    ) -> ExecutionResult {
        self.execute_with_env(job_id, workdir, command, limits, &[])
            .await
    }

    /// Like [`SandboxExecutor::execute`], with extra environment variables
    /// for the agent process.
    pub async fn execute_with_env(
        &self,
        job_id: &str,
        workdir: &Path,
        command: &str,
        limits: &ResourceLimits,
        env: &[(String, String)],
    ) -> ExecutionResult {
        let start = Instant::now();

        if self.validate_entry {
            if let Some(diagnostic) = check_entry_file(workdir, command) {
                warn!(job_id = %job_id, %diagnostic, "Entry file missing");
                let result =
                    ExecutionResult::failed(exit_codes::ENTRY_MISSING, diagnostic, start.elapsed());
                metrics::record_sandbox_execution("none", result.outcome(), result.duration_seconds);
                return result;
            }
        }

        let runtime = self.select_runtime().await;
        let invocation = Invocation {
            unit_name: Self::unit_name(job_id),
            workdir: absolute_path(workdir),
            command: command.to_string(),
            limits: limits.clone(),
            env: env.to_vec(),
        };
        let isolation = runtime.describe(&invocation);

        info!(
            job_id = %job_id,
            runtime = runtime.kind(),
            command = %command,
            timeout_s = limits.timeout_seconds,
            "Executing agent"
        );

        // Image pulls and container creation happen outside the timed region.
        if let Err(e) = runtime.prepare(&invocation).await {
            error!(job_id = %job_id, error = %e, "Sandbox runtime fault during setup");
            if let Err(e) = runtime.kill(&invocation.unit_name).await {
                warn!(job_id = %job_id, error = %e, "Failed to clean up sandbox unit");
            }
            let mut result = ExecutionResult::failed(
                exit_codes::RUNTIME_FAULT,
                format!("runner exception: {e}"),
                start.elapsed(),
            );
            result.isolation = isolation;
            metrics::record_sandbox_execution(runtime.kind(), result.outcome(), result.duration_seconds);
            return result;
        }

        let outer_limit = limits.timeout() + self.grace;
        let outcome = tokio::time::timeout(outer_limit, runtime.run(&invocation)).await;

        let mut result = match outcome {
            Ok(Ok(output)) => match output.termination {
                Termination::Exited(code) => ExecutionResult {
                    exit_code: clamp_exit_code(code),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    duration_seconds: 0.0,
                    isolation: None,
                },
                Termination::TimedOut => {
                    timeout_result(output.stdout, output.stderr, limits.timeout_seconds)
                }
            },
            Ok(Err(e)) => {
                error!(job_id = %job_id, error = %e, "Sandbox runtime fault");
                ExecutionResult::failed(
                    exit_codes::RUNTIME_FAULT,
                    format!("runner exception: {e}"),
                    Duration::ZERO,
                )
            }
            Err(_) => {
                warn!(job_id = %job_id, "Runtime did not honour timeout, killing unit");
                if let Err(e) = runtime.kill(&invocation.unit_name).await {
                    warn!(job_id = %job_id, error = %e, "Failed to kill sandbox unit");
                }
                timeout_result(String::new(), String::new(), limits.timeout_seconds)
            }
        };

        result.duration_seconds = round_millis(start.elapsed());
        result.isolation = isolation;

        metrics::record_sandbox_execution(runtime.kind(), result.outcome(), result.duration_seconds);
        debug!(
            job_id = %job_id,
            exit_code = result.exit_code,
            duration_s = result.duration_seconds,
            "Execution finished"
        );
        result
    }

    /// Forcibly terminates a running unit on every configured runtime.
    /// Failures are logged and swallowed.
    pub async fn kill(&self, unit_name: &str) {
        let runtimes = self.isolated.iter().chain(std::iter::once(&self.fallback));
        for runtime in runtimes {
            if let Err(e) = runtime.kill(unit_name).await {
                warn!(unit = %unit_name, runtime = runtime.kind(), error = %e, "Kill failed");
            }
        }
    }
}

fn timeout_result(stdout: String, stderr: String, timeout_seconds: u64) -> ExecutionResult {
    let mut stderr = stderr;
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(&format!("TIMEOUT after {timeout_seconds}s"));

    ExecutionResult {
        exit_code: exit_codes::TIMEOUT,
        stdout,
        stderr,
        duration_seconds: 0.0,
        isolation: None,
    }
}

/// Locates the entry file referenced by `command` and checks it exists in
/// `workdir`. Returns a diagnostic when it does not.
///
/// See [`entry_file`] for which commands are checked.
pub fn check_entry_file(workdir: &Path, command: &str) -> Option<String> {
    let entry = entry_file(command)?;

    if workdir.join(entry).exists() {
        return None;
    }

    let mut names: Vec<String> = std::fs::read_dir(workdir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();

    let total = names.len();
    names.truncate(MAX_LISTED_ENTRIES);
    let mut listing = names.join(", ");
    if total > MAX_LISTED_ENTRIES {
        listing.push_str(&format!(", ... ({} more)", total - MAX_LISTED_ENTRIES));
    }

    Some(format!(
        "Entry file '{entry}' not found in workdir. Top-level contents: [{listing}]"
    ))
}

/// Interpreters whose first positional argument is the entry script.
const INTERPRETERS: &[&str] = &["python", "python3", "sh", "bash", "node", "ruby", "perl"];

/// Interpreter flags that take code or a module instead of a script path.
const INLINE_FLAGS: &[&str] = &["-c", "-m", "-e"];

/// Shell syntax that makes the working directory or the target ambiguous.
const SHELL_OPERATORS: &[&str] = &["&&", "||", ";", "|", "`", "$(", ">", "<"];

/// Returns the relative script path `command` will run, if it can be
/// determined without interpreting the shell.
///
/// Compound commands and `cd` are never checked. Otherwise the entry is
/// the first positional argument of a known interpreter, or the command
/// itself when it is a relative script path such as `./run.sh`.
fn entry_file(command: &str) -> Option<&str> {
    if SHELL_OPERATORS.iter().any(|op| command.contains(op)) {
        return None;
    }

    let mut tokens = command.split_whitespace();
    let program = tokens.next()?;
    if program == "cd" || program.contains('=') {
        return None;
    }

    let interpreter = program.rsplit('/').next().unwrap_or(program);
    let candidate = if INTERPRETERS.contains(&interpreter) {
        let mut positional = None;
        for token in tokens {
            if INLINE_FLAGS.contains(&token) {
                return None;
            }
            if !token.starts_with('-') {
                positional = Some(token);
                break;
            }
        }
        positional?
    } else if program.starts_with("./")
        || ENTRY_EXTENSIONS.iter().any(|ext| program.ends_with(ext))
    {
        program
    } else {
        return None;
    };

    let candidate = candidate.trim_matches(|c| c == '"' || c == '\'');
    if candidate.is_empty() || candidate.starts_with('/') || candidate.contains('$') {
        return None;
    }
    Some(candidate)
}

fn absolute_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn clamp_exit_code(code: i64) -> i32 {
    i32::try_from(code).unwrap_or(if code < 0 { i32::MIN } else { i32::MAX })
}

fn round_millis(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::sandbox::runtime::RuntimeOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Runtime that is never available.
    struct Offline;

    #[async_trait]
    impl IsolationRuntime for Offline {
        fn kind(&self) -> &'static str {
            "offline"
        }
        fn is_isolated(&self) -> bool {
            true
        }
        async fn is_available(&self) -> bool {
            false
        }
        async fn run(&self, _invocation: &Invocation) -> Result<RuntimeOutput, SandboxError> {
            panic!("offline runtime must not be invoked");
        }
        async fn kill(&self, _unit_name: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        fn describe(&self, _invocation: &Invocation) -> Option<IsolationInfo> {
            None
        }
    }

    /// Runtime that faults on every run and counts kills.
    #[derive(Default)]
    struct Faulty {
        kills: AtomicUsize,
    }

    #[async_trait]
    impl IsolationRuntime for Faulty {
        fn kind(&self) -> &'static str {
            "faulty"
        }
        fn is_isolated(&self) -> bool {
            true
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn run(&self, _invocation: &Invocation) -> Result<RuntimeOutput, SandboxError> {
            Err(SandboxError::Runtime("daemon exploded".to_string()))
        }
        async fn kill(&self, _unit_name: &str) -> Result<(), SandboxError> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Err(SandboxError::Runtime("no such unit".to_string()))
        }
        fn describe(&self, invocation: &Invocation) -> Option<IsolationInfo> {
            Some(IsolationInfo {
                runtime: "faulty".to_string(),
                unit_name: invocation.unit_name.clone(),
                image: "test".to_string(),
                network_disabled: true,
            })
        }
    }

    /// Runtime with slow setup whose runs finish immediately.
    #[derive(Default)]
    struct SlowSetup {
        prepared: AtomicUsize,
    }

    #[async_trait]
    impl IsolationRuntime for SlowSetup {
        fn kind(&self) -> &'static str {
            "slow_setup"
        }
        fn is_isolated(&self) -> bool {
            true
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn prepare(&self, _invocation: &Invocation) -> Result<(), SandboxError> {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn run(&self, _invocation: &Invocation) -> Result<RuntimeOutput, SandboxError> {
            assert_eq!(self.prepared.load(Ordering::SeqCst), 1);
            Ok(RuntimeOutput {
                termination: Termination::Exited(0),
                stdout: "ready".to_string(),
                stderr: String::new(),
            })
        }
        async fn kill(&self, _unit_name: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        fn describe(&self, _invocation: &Invocation) -> Option<IsolationInfo> {
            None
        }
    }

    /// Runtime whose setup always fails.
    #[derive(Default)]
    struct BrokenSetup {
        kills: AtomicUsize,
    }

    #[async_trait]
    impl IsolationRuntime for BrokenSetup {
        fn kind(&self) -> &'static str {
            "broken_setup"
        }
        fn is_isolated(&self) -> bool {
            true
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn prepare(&self, _invocation: &Invocation) -> Result<(), SandboxError> {
            Err(SandboxError::Runtime("Failed to pull image: denied".to_string()))
        }
        async fn run(&self, _invocation: &Invocation) -> Result<RuntimeOutput, SandboxError> {
            panic!("run must not follow a failed setup");
        }
        async fn kill(&self, _unit_name: &str) -> Result<(), SandboxError> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn describe(&self, _invocation: &Invocation) -> Option<IsolationInfo> {
            None
        }
    }

    fn local_executor() -> SandboxExecutor {
        SandboxExecutor::with_runtimes(Some(Arc::new(Offline)), Arc::new(LocalRuntime::new()))
    }

    #[tokio::test]
    async fn test_falls_back_to_local_without_isolation_id() {
        let temp = TempDir::new().unwrap();
        let result = local_executor()
            .execute("job", temp.path(), "echo hi", &ResourceLimits::default())
            .await;

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hi");
        assert!(result.isolation.is_none());
    }

    #[tokio::test]
    async fn test_timeout_sets_sentinel_and_annotation() {
        let temp = TempDir::new().unwrap();
        let limits = ResourceLimits::default().with_timeout_seconds(1);
        let result = local_executor()
            .execute("job", temp.path(), "sleep 999", &limits)
            .await;

        assert_eq!(result.exit_code, exit_codes::TIMEOUT);
        assert!(result.timed_out());
        assert!(result.stderr.contains("TIMEOUT after 1s"));
        assert!(result.duration_seconds >= 1.0);
        assert!(result.duration_seconds < 1.0 + RUNTIME_GRACE.as_secs_f64());
    }

    #[tokio::test]
    async fn test_entry_file_missing_short_circuits() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("README.md"), "x").unwrap();
        std::fs::create_dir(temp.path().join("lib")).unwrap();

        let result = local_executor()
            .execute("job", temp.path(), "python agent_main.py", &ResourceLimits::default())
            .await;

        assert_eq!(result.exit_code, exit_codes::ENTRY_MISSING);
        assert!(result.stderr.contains("agent_main.py"));
        assert!(result.stderr.contains("[README.md, lib]"));
    }

    #[tokio::test]
    async fn test_runtime_fault_is_captured() {
        let temp = TempDir::new().unwrap();
        let faulty = Arc::new(Faulty::default());
        let executor = SandboxExecutor::with_runtimes(
            Some(faulty.clone() as Arc<dyn IsolationRuntime>),
            Arc::new(LocalRuntime::new()),
        )
        .with_entry_validation(false);

        let result = executor
            .execute("job-9", temp.path(), "true", &ResourceLimits::default())
            .await;

        assert_eq!(result.exit_code, exit_codes::RUNTIME_FAULT);
        assert!(result.stderr.contains("daemon exploded"));
        assert_eq!(
            result.isolation.map(|i| i.unit_name),
            Some("nle_sandbox_job-9".to_string())
        );

        // Kill failures are swallowed.
        executor.kill("nle_sandbox_job-9").await;
        assert_eq!(faulty.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_setup_time_not_counted_against_timeout() {
        let temp = TempDir::new().unwrap();
        let executor = SandboxExecutor::with_runtimes(
            Some(Arc::new(SlowSetup::default())),
            Arc::new(LocalRuntime::new()),
        )
        .with_entry_validation(false)
        .with_runtime_grace(Duration::from_millis(100));
        let limits = ResourceLimits::default().with_timeout_seconds(1);

        let result = executor.execute("job", temp.path(), "true", &limits).await;

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "ready");
    }

    #[tokio::test]
    async fn test_setup_failure_is_runtime_fault() {
        let temp = TempDir::new().unwrap();
        let broken = Arc::new(BrokenSetup::default());
        let executor = SandboxExecutor::with_runtimes(
            Some(broken.clone() as Arc<dyn IsolationRuntime>),
            Arc::new(LocalRuntime::new()),
        )
        .with_entry_validation(false);

        let result = executor
            .execute("job", temp.path(), "true", &ResourceLimits::default())
            .await;

        assert_eq!(result.exit_code, exit_codes::RUNTIME_FAULT);
        assert!(result.stderr.contains("Failed to pull image"));
        assert_eq!(broken.kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_check_entry_file_listing_is_capped() {
        let temp = TempDir::new().unwrap();
        for i in 0..25 {
            std::fs::write(temp.path().join(format!("file_{i:02}.txt")), "").unwrap();
        }

        let diagnostic = check_entry_file(temp.path(), "python main.py").unwrap();
        assert!(diagnostic.contains("file_19.txt"));
        assert!(!diagnostic.contains("file_20.txt"));
        assert!(diagnostic.contains("(5 more)"));
    }

    #[test]
    fn test_check_entry_file_ignores_plain_commands() {
        let temp = TempDir::new().unwrap();
        assert!(check_entry_file(temp.path(), "echo hello").is_none());
        assert!(check_entry_file(temp.path(), "/usr/bin/env true").is_none());
        std::fs::create_dir(temp.path().join("bin")).unwrap();
        std::fs::write(temp.path().join("bin").join("run.sh"), "").unwrap();
        assert!(check_entry_file(temp.path(), "sh ./bin/run.sh --fast").is_none());
    }

    #[test]
    fn test_check_entry_file_skips_compound_commands() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src").join("main.py"), "").unwrap();

        assert!(check_entry_file(temp.path(), "cd src && python main.py").is_none());
        assert!(check_entry_file(temp.path(), "cd src; python main.py").is_none());
        assert!(check_entry_file(temp.path(), "python main.py | tee out.log").is_none());
    }

    #[test]
    fn test_check_entry_file_skips_inline_code() {
        let temp = TempDir::new().unwrap();
        assert!(check_entry_file(temp.path(), "python -c \"print('a/b')\"").is_none());
        assert!(check_entry_file(temp.path(), "python3 -m agent.main").is_none());
        assert!(check_entry_file(temp.path(), "sh -c 'exec ./run.sh'").is_none());
    }

    #[test]
    fn test_check_entry_file_follows_interpreter_argument() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("agent_main.py"), "").unwrap();

        assert!(check_entry_file(temp.path(), "python3 -u agent_main.py --verbose").is_none());
        assert!(check_entry_file(temp.path(), "/usr/bin/python3 agent_main.py").is_none());
        let diagnostic = check_entry_file(temp.path(), "python3 -u main.py").unwrap();
        assert!(diagnostic.contains("'main.py'"));
        let diagnostic = check_entry_file(temp.path(), "./start.sh").unwrap();
        assert!(diagnostic.contains("'./start.sh'"));
    }

    #[test]
    fn test_outcome_labels() {
        let r = |code| ExecutionResult::failed(code, "", Duration::ZERO);
        assert_eq!(r(0).outcome(), "success");
        assert_eq!(r(3).outcome(), "nonzero_exit");
        assert_eq!(r(exit_codes::ARCHIVE_MISSING).outcome(), "archive_missing");
    }
}
