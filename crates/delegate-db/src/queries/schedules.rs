//! Repository functions for the `schedules` and `schedule_executions` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{
    ExecutionStatus, MissedRunPolicy, Schedule, ScheduleExecution, ScheduleStatus, ScheduleType,
    TaskPriority, TaskTemplate,
};

/// Fields for inserting a new schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub missed_run_policy: MissedRunPolicy,
    pub task_template: TaskTemplate,
    pub priority: TaskPriority,
    pub max_runs: Option<i64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Insert a new active schedule and return it.
pub async fn insert_schedule(pool: &SqlitePool, new: &NewSchedule) -> Result<Schedule> {
    let schedule = sqlx::query_as::<_, Schedule>(
        "INSERT INTO schedules \
             (id, schedule_type, cron_expression, scheduled_at, timezone, status, \
              missed_run_policy, task_template, priority, max_runs, next_run_at, \
              expires_at, created_at) \
         VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8, $9, $10, $11, $12) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.schedule_type)
    .bind(&new.cron_expression)
    .bind(new.scheduled_at)
    .bind(&new.timezone)
    .bind(new.missed_run_policy)
    .bind(Json(new.task_template.clone()))
    .bind(new.priority)
    .bind(new.max_runs)
    .bind(new.next_run_at)
    .bind(new.expires_at)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert schedule")?;

    Ok(schedule)
}

/// Fetch a schedule by ID.
pub async fn get_schedule(pool: &SqlitePool, id: Uuid) -> Result<Option<Schedule>> {
    let schedule = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch schedule")?;

    Ok(schedule)
}

/// List schedules, optionally filtered by status, newest first.
pub async fn list_schedules(
    pool: &SqlitePool,
    status: Option<ScheduleStatus>,
) -> Result<Vec<Schedule>> {
    let schedules = match status {
        Some(status) => {
            sqlx::query_as::<_, Schedule>(
                "SELECT * FROM schedules WHERE status = $1 ORDER BY created_at DESC",
            )
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Schedule>("SELECT * FROM schedules ORDER BY created_at DESC")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list schedules")?;

    Ok(schedules)
}

/// Schedules due at `now`: active with a non-null `next_run_at` in the past.
pub async fn find_due(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
    let schedules = sqlx::query_as::<_, Schedule>(
        "SELECT * FROM schedules \
         WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= $1 \
         ORDER BY next_run_at ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to find due schedules")?;

    Ok(schedules)
}

/// Write `next_run_at` unconditionally (a future instant, or NULL).
///
/// Every post-trigger and post-skip path goes through here or
/// [`record_run`], so a computation failure can never strand a stale
/// past `next_run_at` that would re-trigger on each tick.
pub async fn set_next_run(
    pool: &SqlitePool,
    id: Uuid,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE schedules SET next_run_at = $1 WHERE id = $2")
        .bind(next_run_at)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set next run")?;

    Ok(result.rows_affected())
}

/// Record a completed firing: bump `run_count`, stamp `last_run_at`, and
/// always include `next_run_at` (future value or NULL) and the resulting
/// status in the same statement.
pub async fn record_run(
    pool: &SqlitePool,
    id: Uuid,
    last_run_at: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
    status: ScheduleStatus,
) -> Result<u64> {
    // Non-active statuses never keep a next_run_at.
    let next = if status == ScheduleStatus::Active {
        next_run_at
    } else {
        None
    };

    let result = sqlx::query(
        "UPDATE schedules \
         SET run_count = run_count + 1, last_run_at = $1, next_run_at = $2, status = $3 \
         WHERE id = $4",
    )
    .bind(last_run_at)
    .bind(next)
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record schedule run")?;

    Ok(result.rows_affected())
}

/// Atomically transition a schedule's status, with optimistic locking on
/// the expected `from` status.
///
/// `next_run_at` is always written: callers resuming a schedule pass the
/// recomputed future instant; every other transition clears it.
pub async fn transition_status(
    pool: &SqlitePool,
    id: Uuid,
    from: ScheduleStatus,
    to: ScheduleStatus,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let next = if to == ScheduleStatus::Active {
        next_run_at
    } else {
        None
    };

    let result = sqlx::query(
        "UPDATE schedules SET status = $1, next_run_at = $2 WHERE id = $3 AND status = $4",
    )
    .bind(to)
    .bind(next)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition schedule status")?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Executions (audit trail)
// ---------------------------------------------------------------------------

/// Fields for inserting an execution audit row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub schedule_id: Uuid,
    pub task_id: Option<Uuid>,
    pub scheduled_for: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
}

/// Insert one audit record for a schedule firing decision.
pub async fn insert_execution(pool: &SqlitePool, new: &NewExecution) -> Result<ScheduleExecution> {
    let execution = sqlx::query_as::<_, ScheduleExecution>(
        "INSERT INTO schedule_executions \
             (schedule_id, task_id, scheduled_for, executed_at, status, error_message, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.schedule_id)
    .bind(new.task_id)
    .bind(new.scheduled_for)
    .bind(new.executed_at)
    .bind(new.status)
    .bind(&new.error_message)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert schedule execution")?;

    Ok(execution)
}

/// List the audit trail for one schedule, oldest first.
pub async fn list_executions(
    pool: &SqlitePool,
    schedule_id: Uuid,
) -> Result<Vec<ScheduleExecution>> {
    let executions = sqlx::query_as::<_, ScheduleExecution>(
        "SELECT * FROM schedule_executions WHERE schedule_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(schedule_id)
    .fetch_all(pool)
    .await
    .context("failed to list schedule executions")?;

    Ok(executions)
}
