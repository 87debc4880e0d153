//! Isolation runtimes.
//!
//! An [`IsolationRuntime`] runs one shell command against a staged work
//! directory and reports how it terminated. Two implementations exist:
//!
//! - [`DockerRuntime`]: a container per job via the Docker API (bollard),
//!   with the work directory mounted read-only, networking disabled and
//!   cpu/memory limits applied.
//! - [`LocalRuntime`]: direct, unconfined execution on the host. Used only
//!   when no isolation runtime is reachable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::resources::ResourceLimits;
use crate::error::SandboxError;

/// Upper bound on bytes retained per output stream.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Mount point of the work directory inside the container.
const CONTAINER_WORKDIR: &str = "/agent";

/// How long to wait for a killed local process and its pipes to drain.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// One command invocation against a staged work directory.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Per-job unique unit name (container name for Docker).
    pub unit_name: String,
    /// Absolute path of the staged work directory.
    pub workdir: PathBuf,
    /// Shell command to run from inside the work directory.
    pub command: String,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Extra environment variables for the agent process.
    pub env: Vec<(String, String)>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited with this code.
    Exited(i64),
    /// The wall-clock limit fired and the unit was killed.
    TimedOut,
}

/// Output of a runtime invocation. On timeout the streams hold whatever was
/// captured before the unit was killed.
#[derive(Debug, Clone)]
pub struct RuntimeOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
}

/// Identifies the isolation a run executed under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationInfo {
    /// Runtime kind (e.g. "docker").
    pub runtime: String,
    /// Unique unit identifier (container name).
    pub unit_name: String,
    /// Base image.
    pub image: String,
    /// Whether networking was disabled.
    pub network_disabled: bool,
}

/// An execution environment able to run a command against a work directory.
#[async_trait]
pub trait IsolationRuntime: Send + Sync {
    /// Short runtime name for logs and metrics.
    fn kind(&self) -> &'static str;

    /// Whether the runtime provides resource and network isolation.
    fn is_isolated(&self) -> bool;

    /// Checks whether the runtime can accept work right now.
    async fn is_available(&self) -> bool;

    /// Sets up everything `run` needs before the agent starts, such as
    /// pulling the image and creating the container. Not counted against
    /// the job timeout.
    async fn prepare(&self, _invocation: &Invocation) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Runs a prepared invocation, enforcing `invocation.limits.timeout()`.
    async fn run(&self, invocation: &Invocation) -> Result<RuntimeOutput, SandboxError>;

    /// Forcibly terminates and removes a unit. Idempotent.
    async fn kill(&self, unit_name: &str) -> Result<(), SandboxError>;

    /// Describes the isolation applied to `invocation`, if any.
    fn describe(&self, invocation: &Invocation) -> Option<IsolationInfo>;
}

// ============================================================================
// Docker
// ============================================================================

/// Docker-backed isolation runtime.
pub struct DockerRuntime {
    docker: Docker,
    image: String,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    ///
    /// Connecting does not contact the daemon; use
    /// [`IsolationRuntime::is_available`] to check it.
    pub fn connect(image: impl Into<String>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::IsolationUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self {
            docker,
            image: image.into(),
        })
    }

    /// Base image used for every container.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Builds the container configuration for an invocation.
    pub fn container_config(
        image: &str,
        invocation: &Invocation,
    ) -> Result<Config<String>, SandboxError> {
        let memory = invocation
            .limits
            .memory_bytes()
            .map_err(SandboxError::Runtime)?;

        let host_config = HostConfig {
            memory: Some(memory),
            memory_swap: Some(memory),
            nano_cpus: Some(invocation.limits.nano_cpus()),
            network_mode: Some("none".to_string()),
            binds: Some(vec![format!(
                "{}:{}:ro",
                invocation.workdir.display(),
                CONTAINER_WORKDIR
            )]),
            ..Default::default()
        };

        Ok(Config {
            image: Some(image.to_string()),
            cmd: Some(vec![
                "bash".to_string(),
                "-lc".to_string(),
                format!("cd {} && {}", CONTAINER_WORKDIR, invocation.command),
            ]),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            env: (!invocation.env.is_empty()).then(|| {
                invocation
                    .env
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect()
            }),
            network_disabled: Some(true),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        })
    }

    async fn ensure_image(&self) -> Result<(), SandboxError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }

        info!(image = %self.image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Runtime(format!("Failed to pull image: {e}")))?;
        }
        Ok(())
    }

    async fn wait_for_exit(&self, name: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(name, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit status as an error
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Runtime(format!(
                "Error waiting for container: {e}"
            ))),
            None => {
                let info = self
                    .docker
                    .inspect_container(name, None::<InspectContainerOptions>)
                    .await
                    .map_err(|e| {
                        SandboxError::Runtime(format!("Failed to inspect container: {e}"))
                    })?;
                Ok(info.state.and_then(|s| s.exit_code).unwrap_or(-1))
            }
        }
    }

    async fn collect_logs(&self, name: &str) -> (String, String) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut logs = self.docker.logs(name, Some(options));

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => append_capped(&mut stdout, &message),
                Ok(LogOutput::StdErr { message }) => append_capped(&mut stderr, &message),
                Ok(_) => {}
                Err(e) => {
                    warn!(container = %name, error = %e, "Error reading container logs");
                    break;
                }
            }
        }

        (
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        )
    }

    async fn remove_quietly(&self, name: &str) {
        if let Err(e) = self.kill(name).await {
            warn!(container = %name, error = %e, "Failed to remove container");
        }
    }
}

#[async_trait]
impl IsolationRuntime for DockerRuntime {
    fn kind(&self) -> &'static str {
        "docker"
    }

    fn is_isolated(&self) -> bool {
        true
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn prepare(&self, invocation: &Invocation) -> Result<(), SandboxError> {
        self.ensure_image().await?;

        let config = Self::container_config(&self.image, invocation)?;
        let options = CreateContainerOptions {
            name: invocation.unit_name.clone(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::Runtime(format!("Failed to create container: {e}")))?;
        Ok(())
    }

    async fn run(&self, invocation: &Invocation) -> Result<RuntimeOutput, SandboxError> {
        let name = invocation.unit_name.as_str();

        if let Err(e) = self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_quietly(name).await;
            return Err(SandboxError::Runtime(format!(
                "Failed to start container: {e}"
            )));
        }

        debug!(container = %name, "Container started");
        let waited = tokio::time::timeout(invocation.limits.timeout(), self.wait_for_exit(name)).await;

        // Logs are read before removal so partial output survives a timeout.
        let (stdout, stderr) = self.collect_logs(name).await;
        self.remove_quietly(name).await;

        let termination = match waited {
            Ok(Ok(code)) => Termination::Exited(code),
            Ok(Err(e)) => return Err(e),
            Err(_) => Termination::TimedOut,
        };

        Ok(RuntimeOutput {
            termination,
            stdout,
            stderr,
        })
    }

    async fn kill(&self, unit_name: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(unit_name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(SandboxError::Runtime(format!(
                "Failed to remove container: {e}"
            ))),
        }
    }

    fn describe(&self, invocation: &Invocation) -> Option<IsolationInfo> {
        Some(IsolationInfo {
            runtime: self.kind().to_string(),
            unit_name: invocation.unit_name.clone(),
            image: self.image.clone(),
            network_disabled: true,
        })
    }
}

// ============================================================================
// Local (unconfined)
// ============================================================================

/// Unconfined host execution. Provides no resource or network isolation.
pub struct LocalRuntime {
    shell: String,
    /// Process-group leaders of runs in flight, by unit name.
    running: Mutex<HashMap<String, u32>>,
}

impl LocalRuntime {
    /// Creates a local runtime using `sh -c`.
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Uses a different shell binary.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IsolationRuntime for LocalRuntime {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn is_isolated(&self) -> bool {
        false
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn run(&self, invocation: &Invocation) -> Result<RuntimeOutput, SandboxError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&invocation.command)
            .current_dir(&invocation.workdir)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let group = ProcessGroup::register(&self.running, &invocation.unit_name, pid);
        let (stdout_buf, stdout_task) = spawn_reader(child.stdout.take());
        let (stderr_buf, stderr_task) = spawn_reader(child.stderr.take());

        let waited = tokio::time::timeout(invocation.limits.timeout(), child.wait()).await;

        let termination = match waited {
            Ok(Ok(status)) => Termination::Exited(exit_code_of(status)),
            Ok(Err(e)) => return Err(SandboxError::Io(e)),
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.start_kill();
                let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                Termination::TimedOut
            }
        };
        group.release();

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = tokio::time::timeout(KILL_GRACE, task).await;
        }

        Ok(RuntimeOutput {
            termination,
            stdout: take_buffer(&stdout_buf),
            stderr: take_buffer(&stderr_buf),
        })
    }

    async fn kill(&self, unit_name: &str) -> Result<(), SandboxError> {
        let pid = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(unit_name);
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        Ok(())
    }

    fn describe(&self, _invocation: &Invocation) -> Option<IsolationInfo> {
        None
    }
}

/// Registration of an in-flight process group under its unit name.
///
/// Dropping it without [`ProcessGroup::release`], as happens when the run
/// future is aborted, kills the whole group.
struct ProcessGroup<'a> {
    running: &'a Mutex<HashMap<String, u32>>,
    unit_name: String,
    pid: Option<u32>,
}

impl<'a> ProcessGroup<'a> {
    fn register(running: &'a Mutex<HashMap<String, u32>>, unit_name: &str, pid: Option<u32>) -> Self {
        if let Some(pid) = pid {
            running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(unit_name.to_string(), pid);
        }
        Self {
            running,
            unit_name: unit_name.to_string(),
            pid,
        }
    }

    /// Unregisters the group without signalling it.
    fn release(mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroup<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.unit_name);
        if let Some(pid) = self.pid.take() {
            kill_process_group(pid);
        }
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Drains a pipe into a shared buffer so partial output is available even if
/// the process is killed mid-write.
fn spawn_reader<R>(reader: Option<R>) -> (SharedBuffer, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
    let Some(mut reader) = reader else {
        return (buffer, None);
    };

    let sink = Arc::clone(&buffer);
    let handle = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut buf = sink.lock().unwrap_or_else(|e| e.into_inner());
                    append_capped(&mut buf, &chunk[..n]);
                }
            }
        }
    });
    (buffer, Some(handle))
}

fn take_buffer(buffer: &SharedBuffer) -> String {
    let buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
    String::from_utf8_lossy(&buf).into_owned()
}

fn append_capped(buf: &mut Vec<u8>, data: &[u8]) {
    let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
    buf.extend_from_slice(&data[..data.len().min(room)]);
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => i64::from(code),
        None => 128 + i64::from(status.signal().unwrap_or(0)),
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    i64::from(status.code().unwrap_or(1))
}

/// Sends SIGKILL to every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group already exited
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pid, error = %err, "Failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn invocation(workdir: &std::path::Path, command: &str, timeout: u64) -> Invocation {
        Invocation {
            unit_name: "nle_sandbox_test".to_string(),
            workdir: workdir.to_path_buf(),
            command: command.to_string(),
            limits: ResourceLimits::new(timeout, "256m", 0.5),
            env: Vec::new(),
        }
    }

    #[test]
    fn test_container_config_applies_limits() {
        let inv = invocation(std::path::Path::new("/data/work/job-1"), "python agent_main.py", 30);
        let config = DockerRuntime::container_config("python:3.11-slim", &inv).unwrap();

        assert_eq!(config.image.as_deref(), Some("python:3.11-slim"));
        assert_eq!(config.network_disabled, Some(true));
        let cmd = config.cmd.unwrap();
        assert_eq!(cmd[0], "bash");
        assert_eq!(cmd[2], "cd /agent && python agent_main.py");

        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(
            host.binds.unwrap(),
            vec!["/data/work/job-1:/agent:ro".to_string()]
        );
    }

    #[test]
    fn test_container_config_rejects_bad_memory() {
        let mut inv = invocation(std::path::Path::new("/w"), "true", 1);
        inv.limits.memory = "huge".to_string();
        assert!(DockerRuntime::container_config("img", &inv).is_err());
    }

    #[test]
    fn test_append_capped() {
        let mut buf = vec![0u8; MAX_CAPTURE_BYTES - 2];
        append_capped(&mut buf, b"abcdef");
        assert_eq!(buf.len(), MAX_CAPTURE_BYTES);
        assert_eq!(&buf[buf.len() - 2..], b"ab");
    }

    #[tokio::test]
    async fn test_local_runtime_captures_streams() {
        let temp = TempDir::new().unwrap();
        let runtime = LocalRuntime::new();
        let output = runtime
            .run(&invocation(temp.path(), "echo out; echo err 1>&2; exit 3", 10))
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Exited(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(runtime.describe(&invocation(temp.path(), "x", 1)).is_none());
    }

    #[tokio::test]
    async fn test_local_runtime_runs_in_workdir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "here").unwrap();
        let output = LocalRuntime::new()
            .run(&invocation(temp.path(), "cat marker.txt", 10))
            .await
            .unwrap();
        assert_eq!(output.stdout, "here");
    }

    #[tokio::test]
    async fn test_local_runtime_timeout_keeps_partial_output() {
        let temp = TempDir::new().unwrap();
        let start = std::time::Instant::now();
        let output = LocalRuntime::new()
            .run(&invocation(temp.path(), "echo started; sleep 999", 1))
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::TimedOut);
        assert!(output.stdout.contains("started"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_local_runtime_passes_env() {
        let temp = TempDir::new().unwrap();
        let mut inv = invocation(temp.path(), "echo \"$AGENT_PROMPT\"", 10);
        inv.env = vec![("AGENT_PROMPT".to_string(), "turn on the light".to_string())];

        let output = LocalRuntime::new().run(&inv).await.unwrap();
        assert_eq!(output.stdout.trim(), "turn on the light");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_runtime_kill_by_unit_name() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(LocalRuntime::new());
        let inv = invocation(temp.path(), "sleep 30", 60);

        let task = {
            let runtime = runtime.clone();
            let inv = inv.clone();
            tokio::spawn(async move { runtime.run(&inv).await })
        };
        while !runtime
            .running
            .lock()
            .unwrap()
            .contains_key(&inv.unit_name)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        runtime.kill(&inv.unit_name).await.unwrap();
        let output = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(output.termination, Termination::Exited(137));
    }

    /// Live (non-zombie) process check.
    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                stat.rsplit_once(')')
                    .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_aborted_run_kills_process_group() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(LocalRuntime::new());
        let inv = invocation(temp.path(), "sleep 30 & echo $! > child.pid; wait", 60);

        let task = {
            let runtime = runtime.clone();
            let inv = inv.clone();
            tokio::spawn(async move { runtime.run(&inv).await })
        };
        let pid_file = temp.path().join("child.pid");
        while std::fs::read_to_string(&pid_file)
            .map(|s| s.trim().is_empty())
            .unwrap_or(true)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let child_pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        assert!(is_running(&child_pid));

        task.abort();
        let _ = task.await;
        assert!(runtime.running.lock().unwrap().is_empty());

        let mut alive = true;
        for _ in 0..50 {
            if !is_running(&child_pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background child survived the aborted run");
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_process_group_signals_whole_group() {
        use std::os::unix::process::{CommandExt, ExitStatusExt};

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();

        kill_process_group(child.id());
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));

        // Already reaped: signalling again is a quiet no-op.
        kill_process_group(child.id());
    }
}
