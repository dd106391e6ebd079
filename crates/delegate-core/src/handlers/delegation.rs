//! The delegation path: validate, persist, record dependencies, enqueue.
//!
//! Everything that creates or cancels tasks funnels through
//! [`DelegationService`] -- the CLI, the schedule handler, and resume all
//! use the same entry point, so every task reaches the queue the same way.

use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use delegate_db::models::{NewTask, Task, TaskPriority, TaskStatus};
use delegate_db::queries::{dependencies, tasks};

use crate::error::DelegateError;
use crate::events::{Event, EventBus};
use crate::graph::DependencyGraph;
use crate::queue::TaskQueue;
use crate::worker::WorkerPool;

/// Links a resumed task into its resume chain.
#[derive(Debug, Clone)]
pub struct ResumeChain {
    /// Root of the chain.
    pub parent_task_id: Uuid,
    /// Immediate predecessor.
    pub retry_of: Uuid,
    pub retry_count: i64,
}

/// A request to delegate one task.
#[derive(Debug, Clone)]
pub struct DelegateRequest {
    pub prompt: String,
    pub priority: TaskPriority,
    pub working_directory: String,
    pub use_worktree: bool,
    pub timeout_ms: Option<i64>,
    /// Tasks that must resolve before this one may run.
    pub depends_on: Vec<Uuid>,
    pub chain: Option<ResumeChain>,
}

impl DelegateRequest {
    pub fn new(prompt: impl Into<String>, working_directory: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            priority: TaskPriority::P1,
            working_directory: working_directory.into(),
            use_worktree: false,
            timeout_ms: None,
            depends_on: Vec::new(),
            chain: None,
        }
    }
}

#[derive(Clone)]
pub struct DelegationService {
    db: SqlitePool,
    bus: EventBus,
    queue: Arc<Mutex<TaskQueue>>,
    graph: Arc<Mutex<DependencyGraph>>,
    pool: WorkerPool,
}

impl DelegationService {
    pub fn new(
        db: SqlitePool,
        bus: EventBus,
        queue: Arc<Mutex<TaskQueue>>,
        graph: Arc<Mutex<DependencyGraph>>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            db,
            bus,
            queue,
            graph,
            pool,
        }
    }

    /// Delegate a task: persist it, record any dependency edges, enqueue,
    /// and announce. Errors are returned to the caller verbatim; nothing
    /// partial survives a failure.
    pub async fn delegate(&self, request: DelegateRequest) -> Result<Task, DelegateError> {
        if request.prompt.trim().is_empty() {
            return Err(DelegateError::InvalidInput("prompt is empty".to_string()));
        }
        if request.working_directory.trim().is_empty() {
            return Err(DelegateError::InvalidInput(
                "working directory is empty".to_string(),
            ));
        }
        for dep in &request.depends_on {
            if tasks::get_task(&self.db, *dep).await?.is_none() {
                return Err(DelegateError::TaskNotFound(*dep));
            }
        }

        let status = if request.depends_on.is_empty() {
            TaskStatus::Queued
        } else {
            TaskStatus::Blocked
        };
        let (parent_task_id, retry_of, retry_count) = match &request.chain {
            Some(chain) => (
                Some(chain.parent_task_id),
                Some(chain.retry_of),
                chain.retry_count,
            ),
            None => (None, None, 0),
        };

        let task = tasks::insert_task(
            &self.db,
            &NewTask {
                prompt: request.prompt.clone(),
                priority: request.priority,
                status,
                working_directory: request.working_directory.clone(),
                use_worktree: request.use_worktree,
                timeout_ms: request.timeout_ms,
                parent_task_id,
                retry_of,
                retry_count,
            },
        )
        .await?;

        if !request.depends_on.is_empty() {
            // The repository re-runs the cycle check inside its insert
            // transaction; this is the authoritative gate.
            if let Err(e) =
                dependencies::add_dependencies(&self.db, task.id, &request.depends_on).await
            {
                let _ = tasks::delete_task(&self.db, task.id).await;
                return Err(e.into());
            }
            // Mirror into the in-memory graph.
            let mut graph = self.graph.lock().expect("graph poisoned");
            for dep in &request.depends_on {
                if let Err(e) = graph.add_edge(task.id, *dep) {
                    // The DB accepted the edge; a mirror failure means the
                    // graph drifted. Log loudly but keep going.
                    warn!(task_id = %task.id, dep = %dep, error = %e, "graph mirror rejected edge");
                }
            }
        }

        let enqueue_result = self
            .queue
            .lock()
            .expect("queue poisoned")
            .enqueue(task.clone());
        if let Err(e) = enqueue_result {
            let _ = tasks::delete_task(&self.db, task.id).await;
            self.graph.lock().expect("graph poisoned").remove_task(task.id);
            return Err(e);
        }

        info!(
            task_id = %task.id,
            priority = %task.priority,
            blocked = status == TaskStatus::Blocked,
            "task delegated"
        );
        self.bus
            .emit(Event::TaskDelegated { task: task.clone() })
            .await;
        self.bus.emit(Event::TaskQueued { task_id: task.id }).await;

        Ok(task)
    }

    /// Cancel a task wherever it currently is.
    ///
    /// Running tasks are handed to the worker pool's graceful kill; queued
    /// and blocked tasks are removed from the queue and marked cancelled
    /// directly. Terminal tasks reject the operation.
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), DelegateError> {
        let task = tasks::get_task(&self.db, task_id)
            .await?
            .ok_or(DelegateError::TaskNotFound(task_id))?;

        if task.status.is_terminal() {
            return Err(DelegateError::InvalidOperation(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }

        if task.status == TaskStatus::Running {
            if let Some(worker) = self.pool.worker_for_task(task_id) {
                self.pool.kill(worker.id)?;
                return Ok(());
            }
            // Running in the DB but no live worker: a crash artifact.
            // Fall through and terminate directly.
        }

        self.queue.lock().expect("queue poisoned").remove(&task_id);
        self.graph.lock().expect("graph poisoned").remove_task(task_id);
        let rows = tasks::mark_terminal(&self.db, task_id, TaskStatus::Cancelled, None).await?;
        if rows > 0 {
            self.bus.emit(Event::TaskCancelled { task_id }).await;
        }
        Ok(())
    }
}
