//! Boot-time recovery: re-queue interrupted work, fail stale runs.
//!
//! Runs after the repositories are ready and before any delegation is
//! accepted. Queued (and blocked) tasks re-enter the in-memory queue;
//! running tasks untouched for longer than the staleness threshold are
//! failed with exit code -1 ("crashed before recovery"); fresher running
//! tasks were in flight and are re-queued since completion was never
//! confirmed.

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};

use delegate_db::models::TaskStatus;
use delegate_db::queries::{dependencies, tasks};

use crate::error::DelegateError;
use crate::events::{Event, EventBus};
use crate::graph::DependencyGraph;
use crate::queue::TaskQueue;

/// Running tasks older than this are considered crash orphans.
pub const STALENESS_THRESHOLD_HOURS: i64 = 1;

/// What the recovery pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    pub requeued: usize,
    pub blocked_restored: usize,
    pub failed_stale: usize,
}

/// Run the recovery pass.
pub async fn run_recovery(
    db: &SqlitePool,
    queue: &Arc<Mutex<TaskQueue>>,
    graph: &Arc<Mutex<DependencyGraph>>,
    bus: &EventBus,
) -> Result<RecoverySummary, DelegateError> {
    let mut summary = RecoverySummary::default();

    // Rebuild the in-memory graph from persisted pending edges.
    let edges = dependencies::load_pending_edges(db)
        .await
        .map_err(DelegateError::from)?;
    *graph.lock().expect("graph poisoned") = DependencyGraph::from_edges(&edges);

    // Fail stale running tasks first, so they are not re-queued below.
    let cutoff = Utc::now() - Duration::hours(STALENESS_THRESHOLD_HOURS);
    let stale = tasks::fail_stale_running(db, cutoff).await?;
    summary.failed_stale = stale.len();
    for task in &stale {
        warn!(task_id = %task.id, "failed stale running task from previous run");
        bus.emit(Event::TaskFailed {
            task_id: task.id,
            error: "process crashed before recovery".to_string(),
        })
        .await;
    }

    // Re-queue queued tasks.
    for task in tasks::list_tasks_by_status(db, TaskStatus::Queued).await? {
        let task_id = task.id;
        if let Err(e) = queue.lock().expect("queue poisoned").enqueue(task) {
            warn!(task_id = %task_id, error = %e, "could not re-enqueue task");
            continue;
        }
        summary.requeued += 1;
        bus.emit(Event::TaskQueued { task_id }).await;
    }

    // Blocked tasks go back into the queue too; the autoscaler skips them
    // until their dependencies resolve.
    for task in tasks::list_tasks_by_status(db, TaskStatus::Blocked).await? {
        let task_id = task.id;
        if let Err(e) = queue.lock().expect("queue poisoned").enqueue(task) {
            warn!(task_id = %task_id, error = %e, "could not restore blocked task");
            continue;
        }
        summary.blocked_restored += 1;
    }

    // Recent running tasks: in flight at crash time, completion never
    // confirmed. Reset to queued and re-run.
    for task in tasks::list_tasks_by_status(db, TaskStatus::Running).await? {
        let task_id = task.id;
        let rows =
            tasks::transition_status(db, task_id, TaskStatus::Running, TaskStatus::Queued).await?;
        if rows == 0 {
            continue;
        }
        let mut requeued = task;
        requeued.status = TaskStatus::Queued;
        if let Err(e) = queue.lock().expect("queue poisoned").enqueue(requeued) {
            warn!(task_id = %task_id, error = %e, "could not re-enqueue interrupted task");
            continue;
        }
        summary.requeued += 1;
        bus.emit(Event::TaskQueued { task_id }).await;
    }

    info!(
        requeued = summary.requeued,
        blocked_restored = summary.blocked_restored,
        failed_stale = summary.failed_stale,
        "recovery complete"
    );
    Ok(summary)
}
