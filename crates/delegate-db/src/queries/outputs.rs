//! Repository functions for the `task_output` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::TaskOutput;

/// Upsert the buffered output for a task.
///
/// Overwrites the chunk arrays wholesale; the in-memory capture buffer is
/// the working copy and this row is its durable snapshot.
pub async fn upsert_output(
    pool: &SqlitePool,
    task_id: Uuid,
    stdout: &[String],
    stderr: &[String],
    total_size: i64,
    truncated: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_output (task_id, stdout, stderr, total_size, truncated, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (task_id) DO UPDATE SET \
             stdout = excluded.stdout, \
             stderr = excluded.stderr, \
             total_size = excluded.total_size, \
             truncated = excluded.truncated, \
             updated_at = excluded.updated_at",
    )
    .bind(task_id)
    .bind(Json(stdout.to_vec()))
    .bind(Json(stderr.to_vec()))
    .bind(total_size)
    .bind(truncated)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to upsert task output")?;

    Ok(())
}

/// Record that a task's output spilled to a sidecar file.
///
/// The chunk arrays are cleared in the same statement: once `file_path` is
/// set, the content lives on disk only.
pub async fn mark_spilled(
    pool: &SqlitePool,
    task_id: Uuid,
    file_path: &str,
    total_size: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_output (task_id, stdout, stderr, total_size, truncated, file_path, updated_at) \
         VALUES ($1, '[]', '[]', $2, 0, $3, $4) \
         ON CONFLICT (task_id) DO UPDATE SET \
             stdout = '[]', \
             stderr = '[]', \
             total_size = excluded.total_size, \
             file_path = excluded.file_path, \
             updated_at = excluded.updated_at",
    )
    .bind(task_id)
    .bind(total_size)
    .bind(file_path)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to mark task output as spilled")?;

    Ok(())
}

/// Fetch the stored output row for a task.
pub async fn get_output(pool: &SqlitePool, task_id: Uuid) -> Result<Option<TaskOutput>> {
    let output = sqlx::query_as::<_, TaskOutput>("SELECT * FROM task_output WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task output")?;

    Ok(output)
}

/// Delete the output row for a task. Retention support.
pub async fn delete_output(pool: &SqlitePool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM task_output WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to delete task output")?;

    Ok(result.rows_affected())
}
