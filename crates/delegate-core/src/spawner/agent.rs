//! Default spawner: launches the coding-agent CLI as a subprocess.
//!
//! The agent binary is invoked argv-style (never through a shell) with the
//! task prompt written to stdin, mirroring the `-p` print mode of agent
//! CLIs. The binary path defaults to `claude` on `$PATH` and can point at
//! any executable with the same contract -- tests use shell scripts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{ProcessSpawner, SpawnSpec, SpawnedProcess};

/// Spawner for the agent CLI.
#[derive(Debug, Clone)]
pub struct AgentSpawner {
    binary_path: String,
    extra_args: Vec<String>,
}

impl AgentSpawner {
    /// Look for the default `claude` binary on `$PATH`.
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Use a custom binary path. Tests point this at scripts.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            extra_args: vec!["-p".to_string()],
        }
    }

    /// Replace the argument list passed before the prompt.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl Default for AgentSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSpawner for AgentSpawner {
    fn name(&self) -> &str {
        "agent-cli"
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn SpawnedProcess>> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.extra_args);
        cmd.current_dir(&spec.working_directory);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn agent binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        let pid = child.id().context("child process has no pid")?;
        debug!(pid, task_id = %spec.task_id, "spawned agent process");

        // Write the prompt to stdin and close it so the agent starts.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(spec.prompt.as_bytes()).await {
                warn!(pid, error = %e, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        }

        Ok(Box::new(AgentProcess { pid, child }))
    }
}

/// Handle for one spawned agent process.
#[derive(Debug)]
struct AgentProcess {
    pid: u32,
    child: Child,
}

#[async_trait]
impl SpawnedProcess for AgentProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    async fn wait(&mut self) -> Result<i64> {
        let status = self.child.wait().await.context("failed to wait on agent")?;
        Ok(status.code().map(i64::from).unwrap_or(-1))
    }

    async fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            // SAFETY: pid came from a child we spawned.
            let ret = unsafe { libc::kill(self.pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid = self.pid, "SIGTERM failed; process may already be gone");
            }
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill().context("failed to kill agent")?;
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await.context("failed to kill agent")?;
        Ok(())
    }
}
