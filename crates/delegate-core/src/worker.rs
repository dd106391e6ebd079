//! The worker pool: spawns, tracks, times out, and kills subprocess
//! workers, wiring their output into the capture buffers.
//!
//! Every successful spawn gets exactly one supervision task, and that
//! supervision task emits exactly one terminal event for the worker's
//! task: `TaskCompleted`, `TaskFailed`, `TaskTimeout`, or `TaskCancelled`.
//! The timeout and cancellation paths both follow the graceful-then-
//! forceful discipline: SIGTERM, wait out the grace period, SIGKILL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use delegate_db::models::{Task, TaskStatus};
use delegate_db::queries::tasks;

use crate::capture::OutputCapture;
use crate::config::DelegateConfig;
use crate::error::DelegateError;
use crate::events::{Event, EventBus, OutputStream};
use crate::monitor::ResourceMonitor;
use crate::spawner::{ProcessSpawner, SpawnSpec, SpawnedProcess};

/// Pool timing knobs, extracted from the config snapshot.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub default_timeout: Duration,
    pub kill_grace_period: Duration,
}

impl From<&DelegateConfig> for WorkerPoolConfig {
    fn from(config: &DelegateConfig) -> Self {
        Self {
            default_timeout: Duration::from_millis(config.task_timeout_ms),
            kill_grace_period: Duration::from_millis(config.kill_grace_period_ms),
        }
    }
}

/// Value snapshot of a live worker.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: Uuid,
    pub task_id: Uuid,
    pub started_at: DateTime<Utc>,
}

struct WorkerEntry {
    task_id: Uuid,
    started_at: DateTime<Utc>,
    kill_token: CancellationToken,
    join: JoinHandle<()>,
}

struct PoolInner {
    db: SqlitePool,
    bus: EventBus,
    capture: Arc<OutputCapture>,
    monitor: Arc<ResourceMonitor>,
    spawner: Arc<dyn ProcessSpawner>,
    config: WorkerPoolConfig,
    workers: Mutex<HashMap<Uuid, WorkerEntry>>,
    closed: AtomicBool,
}

/// The worker pool. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        db: SqlitePool,
        bus: EventBus,
        capture: Arc<OutputCapture>,
        monitor: Arc<ResourceMonitor>,
        spawner: Arc<dyn ProcessSpawner>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                db,
                bus,
                capture,
                monitor,
                spawner,
                config,
                workers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn a worker for a queued task.
    ///
    /// Fails with `INSUFFICIENT_RESOURCES` when the monitor refuses, and
    /// with `WORKER_SPAWN_FAILED` (wrapping the cause) when the subprocess
    /// cannot be launched -- in which case no worker event is emitted.
    pub async fn spawn(&self, task: &Task) -> Result<Worker, DelegateError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DelegateError::InvalidOperation(
                "worker pool is shut down".to_string(),
            ));
        }
        if !self.inner.monitor.can_spawn_worker() {
            return Err(DelegateError::InsufficientResources(
                "resource monitor refused the spawn".to_string(),
            ));
        }

        let spec = SpawnSpec {
            task_id: task.id,
            prompt: task.prompt.clone(),
            working_directory: PathBuf::from(&task.working_directory),
            env: HashMap::new(),
        };
        let mut process = self
            .inner
            .spawner
            .spawn(&spec)
            .await
            .map_err(|source| DelegateError::WorkerSpawnFailed { source })?;

        let worker_id = Uuid::new_v4();
        let rows = tasks::mark_running(&self.inner.db, task.id, worker_id).await?;
        if rows == 0 {
            // The task slipped out of `queued` between dequeue and here
            // (e.g. a concurrent cancel). Reap the process quietly.
            let _ = process.kill().await;
            return Err(DelegateError::InvalidOperation(format!(
                "task {} is no longer queued",
                task.id
            )));
        }

        self.inner.monitor.record_spawn();
        self.inner.monitor.worker_started();

        let started_at = Utc::now();
        let kill_token = CancellationToken::new();
        let join = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            worker_id,
            task.clone(),
            process,
            kill_token.clone(),
        ));

        self.inner.workers.lock().expect("worker map poisoned").insert(
            worker_id,
            WorkerEntry {
                task_id: task.id,
                started_at,
                kill_token,
                join,
            },
        );

        info!(worker_id = %worker_id, task_id = %task.id, "worker spawned");
        self.inner
            .bus
            .emit(Event::WorkerSpawned {
                worker_id,
                task_id: task.id,
            })
            .await;

        Ok(Worker {
            id: worker_id,
            task_id: task.id,
            started_at,
        })
    }

    /// Request cancellation of one worker. The supervision task performs
    /// the graceful-then-forceful kill and emits `TaskCancelled`.
    pub fn kill(&self, worker_id: Uuid) -> Result<(), DelegateError> {
        let workers = self.inner.workers.lock().expect("worker map poisoned");
        match workers.get(&worker_id) {
            Some(entry) => {
                entry.kill_token.cancel();
                Ok(())
            }
            None => Err(DelegateError::InvalidOperation(format!(
                "worker {worker_id} not found"
            ))),
        }
    }

    /// Concurrent graceful shutdown of every live worker, with one bounded
    /// wait covering them all.
    pub async fn kill_all(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let entries: Vec<WorkerEntry> = {
            let mut workers = self.inner.workers.lock().expect("worker map poisoned");
            workers.drain().map(|(_, entry)| entry).collect()
        };
        if entries.is_empty() {
            return;
        }

        self.inner
            .bus
            .emit(Event::WorkersTerminating {
                count: entries.len(),
            })
            .await;

        for entry in &entries {
            entry.kill_token.cancel();
        }

        let deadline = self.inner.config.kill_grace_period + Duration::from_secs(5);
        let joins = entries.into_iter().map(|e| e.join);
        if tokio::time::timeout(deadline, futures::future::join_all(joins))
            .await
            .is_err()
        {
            warn!("worker pool shutdown wait expired with workers still terminating");
        }
    }

    /// Snapshot of live workers.
    pub fn live_workers(&self) -> Vec<Worker> {
        let workers = self.inner.workers.lock().expect("worker map poisoned");
        workers
            .iter()
            .map(|(id, entry)| Worker {
                id: *id,
                task_id: entry.task_id,
                started_at: entry.started_at,
            })
            .collect()
    }

    /// The worker currently running the given task, if any.
    pub fn worker_for_task(&self, task_id: Uuid) -> Option<Worker> {
        self.live_workers().into_iter().find(|w| w.task_id == task_id)
    }
}

/// How a supervised worker ended.
enum Outcome {
    Exited(i64),
    TimedOut(Duration),
    Cancelled,
}

/// Supervise one worker from spawn to terminal event.
async fn supervise(
    inner: Arc<PoolInner>,
    worker_id: Uuid,
    task: Task,
    mut process: Box<dyn SpawnedProcess>,
    kill_token: CancellationToken,
) {
    let timeout = task
        .timeout_ms
        .map(|ms| Duration::from_millis(ms as u64))
        .unwrap_or(inner.config.default_timeout);

    let stdout_pump = process
        .take_stdout()
        .map(|reader| spawn_pump(Arc::clone(&inner), task.id, OutputStream::Stdout, reader));
    let stderr_pump = process
        .take_stderr()
        .map(|reader| spawn_pump(Arc::clone(&inner), task.id, OutputStream::Stderr, reader));

    let started = tokio::time::Instant::now();
    let outcome = tokio::select! {
        result = process.wait() => match result {
            Ok(code) => Outcome::Exited(code),
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "wait on worker failed");
                Outcome::Exited(-1)
            }
        },
        _ = tokio::time::sleep(timeout) => Outcome::TimedOut(timeout),
        _ = kill_token.cancelled() => Outcome::Cancelled,
    };

    // Timeout and cancellation share the kill discipline. On natural exit
    // neither timer is live any more: the select dropped them.
    if matches!(outcome, Outcome::TimedOut(_) | Outcome::Cancelled) {
        if let Err(e) = process.terminate().await {
            warn!(worker_id = %worker_id, error = %e, "graceful termination failed");
        }
        let grace = inner.config.kill_grace_period;
        tokio::select! {
            _ = process.wait() => {
                debug!(worker_id = %worker_id, "worker exited within grace period");
            }
            _ = tokio::time::sleep(grace) => {
                warn!(worker_id = %worker_id, "grace period expired, killing worker");
                let _ = process.kill().await;
                let _ = process.wait().await;
            }
        }
    }

    // Let the pumps drain the closed pipes so the tail of the output is
    // captured before persistence.
    if let Some(pump) = stdout_pump {
        let _ = pump.await;
    }
    if let Some(pump) = stderr_pump {
        let _ = pump.await;
    }

    let duration_ms = started.elapsed().as_millis() as i64;
    if let Err(e) = inner.capture.persist_and_release(&inner.db, task.id).await {
        warn!(task_id = %task.id, error = %e, "failed to persist worker output");
    }

    let (status, exit_code, event) = match outcome {
        Outcome::Exited(0) => (
            TaskStatus::Completed,
            Some(0),
            Event::TaskCompleted {
                task_id: task.id,
                exit_code: 0,
                duration_ms,
            },
        ),
        Outcome::Exited(code) => (
            TaskStatus::Failed,
            Some(code),
            Event::TaskFailed {
                task_id: task.id,
                error: format!("worker exited with code {code}"),
            },
        ),
        Outcome::TimedOut(t) => (
            TaskStatus::Timeout,
            None,
            Event::TaskTimeout {
                task_id: task.id,
                timeout_ms: t.as_millis() as i64,
            },
        ),
        Outcome::Cancelled => (
            TaskStatus::Cancelled,
            None,
            Event::TaskCancelled { task_id: task.id },
        ),
    };

    let rows = match tasks::mark_terminal(&inner.db, task.id, status, exit_code).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "failed to persist terminal status");
            0
        }
    };

    inner.monitor.worker_stopped();
    inner
        .workers
        .lock()
        .expect("worker map poisoned")
        .remove(&worker_id);

    // Terminal states are sticky; if another path already terminated the
    // task, the update matched nothing and the event must not be repeated.
    if rows > 0 {
        info!(
            worker_id = %worker_id,
            task_id = %task.id,
            status = %status,
            duration_ms,
            "worker finished"
        );
        inner.bus.emit(event).await;
    } else {
        debug!(task_id = %task.id, "task already terminal; suppressing duplicate event");
    }
}

/// Pump one output stream into the capture buffer, line by line.
fn spawn_pump(
    inner: Arc<PoolInner>,
    task_id: Uuid,
    stream: OutputStream,
    reader: Box<dyn AsyncRead + Send + Unpin>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let chunk = format!("{line}\n");
                    let bytes = inner.capture.capture(task_id, stream, &chunk);
                    inner
                        .bus
                        .emit(Event::OutputCaptured {
                            task_id,
                            stream,
                            bytes,
                        })
                        .await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(task_id = %task_id, stream = %stream, error = %e, "output pump read failed");
                    break;
                }
            }
        }
    })
}
