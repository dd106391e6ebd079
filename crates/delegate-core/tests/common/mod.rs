//! Shared fixtures for delegate-core integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use delegate_core::config::DelegateConfig;
use delegate_core::events::{Event, EventBus, Topic};
use delegate_core::spawner::{ProcessSpawner, SpawnSpec, SpawnedProcess};

/// What a fake worker should do when spawned.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub exit_code: i64,
    pub run_for: Duration,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Ignore the graceful termination signal (forces SIGKILL path).
    pub ignore_term: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            exit_code: 0,
            run_for: Duration::from_millis(20),
            stdout: vec!["fake worker output".to_string()],
            stderr: Vec::new(),
            ignore_term: false,
        }
    }
}

/// A scripted `ProcessSpawner` that needs no real subprocesses.
#[derive(Clone, Default)]
pub struct FakeSpawner {
    default_behavior: FakeBehavior,
    per_task: Arc<Mutex<HashMap<Uuid, FakeBehavior>>>,
    spawn_count: Arc<AtomicUsize>,
    fail_next: Arc<AtomicBool>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_behavior(behavior: FakeBehavior) -> Self {
        Self {
            default_behavior: behavior,
            ..Self::default()
        }
    }

    /// Script the behavior for one specific task.
    pub fn script(&self, task_id: Uuid, behavior: FakeBehavior) {
        self.per_task.lock().unwrap().insert(task_id, behavior);
    }

    /// Make the next spawn fail at launch.
    pub fn fail_next_spawn(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    fn name(&self) -> &str {
        "fake"
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn SpawnedProcess>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("scripted spawn failure");
        }
        let behavior = self
            .per_task
            .lock()
            .unwrap()
            .get(&spec.task_id)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());
        let n = self.spawn_count.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeProcess {
            pid: 10_000 + n as u32,
            exit_code: behavior.exit_code,
            run_for: behavior.run_for,
            ignore_term: behavior.ignore_term,
            stdout: Some(Box::new(Cursor::new(join_lines(&behavior.stdout)))),
            stderr: Some(Box::new(Cursor::new(join_lines(&behavior.stderr)))),
            dead: CancellationToken::new(),
        }))
    }
}

fn join_lines(lines: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    out
}

struct FakeProcess {
    pid: u32,
    exit_code: i64,
    run_for: Duration,
    ignore_term: bool,
    stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    dead: CancellationToken,
}

impl std::fmt::Debug for FakeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeProcess")
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .field("run_for", &self.run_for)
            .field("ignore_term", &self.ignore_term)
            .finish()
    }
}

#[async_trait]
impl SpawnedProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> Result<i64> {
        tokio::select! {
            _ = tokio::time::sleep(self.run_for) => Ok(self.exit_code),
            _ = self.dead.cancelled() => Ok(-1),
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        if !self.ignore_term {
            self.dead.cancel();
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.dead.cancel();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config + event helpers
// ---------------------------------------------------------------------------

/// A config tuned for tests: temp database, no spawn throttling, fast
/// ticks, long schedule interval (tests drive ticks by hand).
pub fn test_config(dir: &std::path::Path) -> DelegateConfig {
    let mut config = DelegateConfig::default();
    config.database_path = dir.join("tasks.db");
    config.memory_reserve = 0;
    config.cpu_cores_reserved = 1;
    config.min_spawn_delay_ms = 0;
    config.settling_window_ms = 0;
    config.resource_monitor_interval_ms = 25;
    config.schedule_check_interval_ms = 600_000;
    config.task_timeout_ms = 5_000;
    config.kill_grace_period_ms = 200;
    config
}

/// Record every event on the given topics into a shared vector.
pub fn collect_events(bus: &EventBus, topics: &[Topic]) -> Arc<Mutex<Vec<Event>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    for topic in topics {
        let collected_clone = Arc::clone(&collected);
        bus.subscribe(*topic, "test-collector", move |event, _replier| {
            let collected = Arc::clone(&collected_clone);
            Box::pin(async move {
                collected.lock().unwrap().push(event);
                Ok(())
            })
        })
        .expect("collector subscription failed");
    }
    collected
}

/// Poll until `predicate` is true or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

/// Poll the database until the task reaches a terminal status.
pub async fn wait_for_terminal(
    db: &sqlx::SqlitePool,
    task_id: Uuid,
    timeout: Duration,
) -> Option<delegate_db::models::Task> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(task)) = delegate_db::queries::tasks::get_task(db, task_id).await {
            if task.status.is_terminal() {
                return Some(task);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}
