//! Repository functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{NewTask, Task, TaskStatus};

/// Insert a new task row and return it.
pub async fn insert_task(pool: &SqlitePool, new: &NewTask) -> Result<Task> {
    let now = Utc::now();
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, prompt, priority, status, working_directory, use_worktree, \
                            timeout_ms, parent_task_id, retry_of, retry_count, \
                            created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&new.prompt)
    .bind(new.priority)
    .bind(new.status)
    .bind(&new.working_directory)
    .bind(new.use_worktree)
    .bind(new.timeout_ms)
    .bind(new.parent_task_id)
    .bind(new.retry_of)
    .bind(new.retry_count)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks in a given status, oldest first.
pub async fn list_tasks_by_status(pool: &SqlitePool, status: TaskStatus) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = $1 ORDER BY created_at ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by status")?;

    Ok(tasks)
}

/// Partial update of a task. Only the fields set here are written.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub worker_id: Option<Uuid>,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Apply a partial update in a single statement.
///
/// `updated_at` is always refreshed. Unset fields are preserved via
/// COALESCE, so a `None` never clears a column.
pub async fn update_task(pool: &SqlitePool, id: Uuid, update: &TaskUpdate) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = COALESCE($1, status), \
             worker_id = COALESCE($2, worker_id), \
             exit_code = COALESCE($3, exit_code), \
             started_at = COALESCE($4, started_at), \
             completed_at = COALESCE($5, completed_at), \
             updated_at = $6 \
         WHERE id = $7",
    )
    .bind(update.status)
    .bind(update.worker_id)
    .bind(update.exit_code)
    .bind(update.started_at)
    .bind(update.completed_at)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task")?;

    Ok(result.rows_affected())
}

/// Atomically transition a task between statuses.
///
/// Optimistic locking: the WHERE clause pins the expected `from` status, so
/// 0 rows affected means the task was not in that status (or is missing).
pub async fn transition_status(
    pool: &SqlitePool,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4",
    )
    .bind(to)
    .bind(Utc::now())
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Mark a task running under a worker: sets `started_at`, bumps `attempts`.
///
/// Only applies to tasks currently `queued`; returns rows affected.
pub async fn mark_running(pool: &SqlitePool, id: Uuid, worker_id: Uuid) -> Result<u64> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', worker_id = $1, started_at = $2, \
             attempts = attempts + 1, updated_at = $2 \
         WHERE id = $3 AND status = 'queued'",
    )
    .bind(worker_id)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task running")?;

    Ok(result.rows_affected())
}

/// Move a task into a terminal status.
///
/// Terminal states are sticky: the WHERE clause refuses to touch a task
/// already in one, so a late kill can never overwrite a completed result.
pub async fn mark_terminal(
    pool: &SqlitePool,
    id: Uuid,
    status: TaskStatus,
    exit_code: Option<i64>,
) -> Result<u64> {
    debug_assert!(status.is_terminal());
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, exit_code = COALESCE($2, exit_code), \
             completed_at = $3, updated_at = $3 \
         WHERE id = $4 \
           AND status NOT IN ('completed', 'failed', 'cancelled', 'timeout')",
    )
    .bind(status)
    .bind(exit_code)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task terminal")?;

    Ok(result.rows_affected())
}

/// Fail every `running` task whose `updated_at` is older than `cutoff`.
///
/// Restart recovery: a running task nobody has touched for that long was
/// orphaned by a crash. Exit code -1 marks "crashed before recovery".
/// Returns the tasks that were failed.
pub async fn fail_stale_running(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let now = Utc::now();
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'failed', exit_code = -1, completed_at = $1, updated_at = $1 \
         WHERE status = 'running' AND updated_at < $2 \
         RETURNING *",
    )
    .bind(now)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to fail stale running tasks")?;

    Ok(tasks)
}

/// Delete terminal tasks completed before `cutoff`. Returns rows deleted.
pub async fn delete_terminal_older_than(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM tasks \
         WHERE status IN ('completed', 'failed', 'cancelled', 'timeout') \
           AND completed_at < $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to delete old terminal tasks")?;

    Ok(result.rows_affected())
}

/// Delete a task row outright. Used to roll back a failed delegation.
pub async fn delete_task(pool: &SqlitePool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete task")?;

    Ok(result.rows_affected())
}
