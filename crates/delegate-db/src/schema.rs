//! Embedded DDL for the delegate database.
//!
//! The schema is applied with `CREATE TABLE IF NOT EXISTS` at pool creation
//! so that no migration tooling or running database is needed at compile
//! time. Enum columns carry CHECK constraints mirroring the Rust enums.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// DDL statements, applied in order.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        prompt TEXT NOT NULL,
        priority TEXT NOT NULL DEFAULT 'p1'
            CHECK (priority IN ('p0', 'p1', 'p2')),
        status TEXT NOT NULL DEFAULT 'queued'
            CHECK (status IN ('queued', 'blocked', 'running', 'completed',
                              'failed', 'cancelled', 'timeout')),
        working_directory TEXT NOT NULL,
        use_worktree INTEGER NOT NULL DEFAULT 0,
        timeout_ms INTEGER,
        worker_id TEXT,
        exit_code INTEGER,
        parent_task_id TEXT,
        retry_of TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks (status, updated_at)",
    "CREATE TABLE IF NOT EXISTS task_output (
        task_id TEXT PRIMARY KEY REFERENCES tasks (id) ON DELETE CASCADE,
        stdout TEXT NOT NULL DEFAULT '[]',
        stderr TEXT NOT NULL DEFAULT '[]',
        total_size INTEGER NOT NULL DEFAULT 0,
        truncated INTEGER NOT NULL DEFAULT 0,
        file_path TEXT,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS task_dependencies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
        depends_on_task_id TEXT NOT NULL,
        resolution TEXT NOT NULL DEFAULT 'pending'
            CHECK (resolution IN ('pending', 'completed', 'failed', 'cancelled')),
        created_at TEXT NOT NULL,
        resolved_at TEXT,
        UNIQUE (task_id, depends_on_task_id),
        CHECK (task_id != depends_on_task_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_deps_task ON task_dependencies (task_id, resolution)",
    "CREATE INDEX IF NOT EXISTS idx_deps_target ON task_dependencies (depends_on_task_id, resolution)",
    "CREATE TABLE IF NOT EXISTS schedules (
        id TEXT PRIMARY KEY,
        schedule_type TEXT NOT NULL
            CHECK (schedule_type IN ('cron', 'one_time')),
        cron_expression TEXT,
        scheduled_at TEXT,
        timezone TEXT NOT NULL DEFAULT 'UTC',
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'paused', 'cancelled', 'completed', 'expired')),
        missed_run_policy TEXT NOT NULL DEFAULT 'skip'
            CHECK (missed_run_policy IN ('skip', 'catchup', 'fail')),
        task_template TEXT NOT NULL,
        priority TEXT NOT NULL DEFAULT 'p1'
            CHECK (priority IN ('p0', 'p1', 'p2')),
        max_runs INTEGER,
        run_count INTEGER NOT NULL DEFAULT 0,
        last_run_at TEXT,
        next_run_at TEXT,
        expires_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (status, next_run_at)",
    "CREATE TABLE IF NOT EXISTS schedule_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        schedule_id TEXT NOT NULL REFERENCES schedules (id) ON DELETE CASCADE,
        task_id TEXT,
        scheduled_for TEXT NOT NULL,
        executed_at TEXT NOT NULL,
        status TEXT NOT NULL
            CHECK (status IN ('triggered', 'skipped', 'failed')),
        error_message TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_executions_schedule ON schedule_executions (schedule_id, created_at)",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
        checkpoint_type TEXT NOT NULL
            CHECK (checkpoint_type IN ('completed', 'failed', 'cancelled', 'timeout')),
        output_summary TEXT,
        error_summary TEXT,
        git_branch TEXT,
        git_commit_sha TEXT,
        git_dirty_files TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_latest ON checkpoints (task_id, created_at DESC, id DESC)",
];

/// Apply the embedded schema to the pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("failed to apply schema statement: {}", first_line(stmt)))?;
    }
    Ok(())
}

fn first_line(stmt: &str) -> &str {
    stmt.lines().next().unwrap_or(stmt).trim()
}
