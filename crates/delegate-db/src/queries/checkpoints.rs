//! Repository functions for the `checkpoints` table.
//!
//! Checkpoint rows are immutable once written; there is no update path.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Checkpoint, CheckpointType, NewCheckpoint};

/// Insert one checkpoint row and return it.
pub async fn insert_checkpoint(
    pool: &SqlitePool,
    task_id: Uuid,
    checkpoint_type: CheckpointType,
    new: &NewCheckpoint,
) -> Result<Checkpoint> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO checkpoints \
             (id, task_id, checkpoint_type, output_summary, error_summary, \
              git_branch, git_commit_sha, git_dirty_files, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(task_id)
    .bind(checkpoint_type)
    .bind(&new.output_summary)
    .bind(&new.error_summary)
    .bind(&new.git_branch)
    .bind(&new.git_commit_sha)
    .bind(new.git_dirty_files.clone().map(Json))
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert checkpoint")?;

    Ok(checkpoint)
}

/// The most recent checkpoint for a task.
///
/// Ordered by `created_at DESC, id DESC`: two checkpoints written in the
/// same millisecond are tie-broken deterministically by id.
pub async fn find_latest(pool: &SqlitePool, task_id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE task_id = $1 \
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest checkpoint")?;

    Ok(checkpoint)
}

/// All checkpoints for a task, newest first.
pub async fn list_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE task_id = $1 \
         ORDER BY created_at DESC, id DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list checkpoints")?;

    Ok(checkpoints)
}

/// Delete every checkpoint for a task. Returns rows deleted.
///
/// Used by tests that need exact "latest" semantics, and by retention.
pub async fn delete_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM checkpoints WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to delete checkpoints")?;

    Ok(result.rows_affected())
}
