//! Integration tests for the task repository.

use chrono::{Duration, Utc};
use uuid::Uuid;

use delegate_db::models::{NewTask, TaskPriority, TaskStatus};
use delegate_db::queries::tasks::{self, TaskUpdate};
use delegate_test_utils::create_test_pool;

#[tokio::test]
async fn insert_and_find_roundtrip_preserves_all_fields() {
    let pool = create_test_pool().await;

    let mut new = NewTask::new("write the parser", "/srv/work");
    new.priority = TaskPriority::P0;
    new.use_worktree = true;
    new.timeout_ms = Some(120_000);

    let task = tasks::insert_task(&pool, &new).await.unwrap();
    let found = tasks::get_task(&pool, task.id).await.unwrap().unwrap();

    assert_eq!(found.id, task.id);
    assert_eq!(found.prompt, "write the parser");
    assert_eq!(found.priority, TaskPriority::P0);
    assert_eq!(found.status, TaskStatus::Queued);
    assert_eq!(found.working_directory, "/srv/work");
    assert!(found.use_worktree);
    assert_eq!(found.timeout_ms, Some(120_000));
    // Nulls preserved as None.
    assert!(found.worker_id.is_none());
    assert!(found.exit_code.is_none());
    assert!(found.parent_task_id.is_none());
    assert!(found.retry_of.is_none());
    assert!(found.started_at.is_none());
    assert!(found.completed_at.is_none());
    assert_eq!(found.retry_count, 0);
    assert_eq!(found.attempts, 0);
}

#[tokio::test]
async fn get_missing_task_returns_none() {
    let pool = create_test_pool().await;
    let found = tasks::get_task(&pool, Uuid::new_v4()).await.unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn mark_running_sets_worker_and_bumps_attempts() {
    let pool = create_test_pool().await;
    let task = tasks::insert_task(&pool, &NewTask::new("t", "/tmp"))
        .await
        .unwrap();

    let worker_id = Uuid::new_v4();
    let rows = tasks::mark_running(&pool, task.id, worker_id).await.unwrap();
    assert_eq!(rows, 1);

    let found = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(found.status, TaskStatus::Running);
    assert_eq!(found.worker_id, Some(worker_id));
    assert_eq!(found.attempts, 1);
    assert!(found.started_at.is_some());

    // Not queued any more, so a second mark_running is a no-op.
    let rows = tasks::mark_running(&pool, task.id, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn terminal_states_are_sticky() {
    let pool = create_test_pool().await;
    let task = tasks::insert_task(&pool, &NewTask::new("t", "/tmp"))
        .await
        .unwrap();

    tasks::mark_running(&pool, task.id, Uuid::new_v4())
        .await
        .unwrap();
    let rows = tasks::mark_terminal(&pool, task.id, TaskStatus::Completed, Some(0))
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // A late timeout/kill must not overwrite the completed result.
    let rows = tasks::mark_terminal(&pool, task.id, TaskStatus::Timeout, None)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let found = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(found.status, TaskStatus::Completed);
    assert_eq!(found.exit_code, Some(0));
    assert!(found.completed_at.is_some());
}

#[tokio::test]
async fn partial_update_preserves_unset_fields() {
    let pool = create_test_pool().await;
    let task = tasks::insert_task(&pool, &NewTask::new("t", "/tmp"))
        .await
        .unwrap();

    let worker_id = Uuid::new_v4();
    tasks::update_task(
        &pool,
        task.id,
        &TaskUpdate {
            worker_id: Some(worker_id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let found = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(found.worker_id, Some(worker_id));
    assert_eq!(found.status, TaskStatus::Queued);
    assert_eq!(found.prompt, "t");
}

#[tokio::test]
async fn fail_stale_running_only_touches_old_rows() {
    let pool = create_test_pool().await;

    let stale = tasks::insert_task(&pool, &NewTask::new("stale", "/tmp"))
        .await
        .unwrap();
    let fresh = tasks::insert_task(&pool, &NewTask::new("fresh", "/tmp"))
        .await
        .unwrap();
    tasks::mark_running(&pool, stale.id, Uuid::new_v4())
        .await
        .unwrap();
    tasks::mark_running(&pool, fresh.id, Uuid::new_v4())
        .await
        .unwrap();

    // Backdate the stale task's updated_at past the cutoff.
    sqlx::query("UPDATE tasks SET updated_at = $1 WHERE id = $2")
        .bind(Utc::now() - Duration::hours(2))
        .bind(stale.id)
        .execute(&pool)
        .await
        .unwrap();

    let failed = tasks::fail_stale_running(&pool, Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, stale.id);
    assert_eq!(failed[0].status, TaskStatus::Failed);
    assert_eq!(failed[0].exit_code, Some(-1));

    let fresh = tasks::get_task(&pool, fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, TaskStatus::Running);
}

#[tokio::test]
async fn retention_deletes_only_old_terminal_tasks() {
    let pool = create_test_pool().await;

    let old = tasks::insert_task(&pool, &NewTask::new("old", "/tmp"))
        .await
        .unwrap();
    let live = tasks::insert_task(&pool, &NewTask::new("live", "/tmp"))
        .await
        .unwrap();
    tasks::mark_running(&pool, old.id, Uuid::new_v4()).await.unwrap();
    tasks::mark_terminal(&pool, old.id, TaskStatus::Completed, Some(0))
        .await
        .unwrap();

    sqlx::query("UPDATE tasks SET completed_at = $1 WHERE id = $2")
        .bind(Utc::now() - Duration::days(60))
        .bind(old.id)
        .execute(&pool)
        .await
        .unwrap();

    let deleted = tasks::delete_terminal_older_than(&pool, Utc::now() - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(tasks::get_task(&pool, old.id).await.unwrap().is_none());
    assert!(tasks::get_task(&pool, live.id).await.unwrap().is_some());
}

#[tokio::test]
async fn resume_chain_fields_roundtrip() {
    let pool = create_test_pool().await;
    let root = tasks::insert_task(&pool, &NewTask::new("root", "/tmp"))
        .await
        .unwrap();

    let mut retry = NewTask::new("retry prompt", "/tmp");
    retry.parent_task_id = Some(root.id);
    retry.retry_of = Some(root.id);
    retry.retry_count = 1;
    let retry = tasks::insert_task(&pool, &retry).await.unwrap();

    let found = tasks::get_task(&pool, retry.id).await.unwrap().unwrap();
    assert_eq!(found.parent_task_id, Some(root.id));
    assert_eq!(found.retry_of, Some(root.id));
    assert_eq!(found.retry_count, 1);
}
