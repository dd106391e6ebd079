//! The `ProcessSpawner` contract -- the adapter seam for launching agent
//! subprocesses.
//!
//! The worker pool only ever talks to these traits; the concrete agent
//! binary (and test fakes) live behind them.

pub mod agent;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;
use uuid::Uuid;

pub use agent::AgentSpawner;

/// Everything a spawner needs to launch one worker.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub task_id: Uuid,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub env: HashMap<String, String>,
}

/// A live subprocess handle.
///
/// Stdout/stderr are `take`-able exactly once each; the pool moves them
/// into its pump tasks. `terminate` asks politely (SIGTERM), `kill` does
/// not (SIGKILL).
#[async_trait]
pub trait SpawnedProcess: Send + std::fmt::Debug {
    fn pid(&self) -> u32;

    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    /// Wait for exit and return the exit code (-1 when killed by signal).
    async fn wait(&mut self) -> Result<i64>;

    /// Graceful termination signal.
    async fn terminate(&mut self) -> Result<()>;

    /// Forceful kill.
    async fn kill(&mut self) -> Result<()>;
}

/// Adapter interface for spawning agent subprocesses.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Human-readable adapter name for logs.
    fn name(&self) -> &str;

    /// Launch a subprocess for the given spec.
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn SpawnedProcess>>;
}

// Compile-time assertion: ProcessSpawner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ProcessSpawner) {}
};
