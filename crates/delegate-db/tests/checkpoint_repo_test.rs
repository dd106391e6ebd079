//! Integration tests for the checkpoint repository.

use delegate_db::models::{CheckpointType, NewCheckpoint, NewTask};
use delegate_db::queries::{checkpoints, tasks};
use delegate_test_utils::create_test_pool;

#[tokio::test]
async fn insert_and_find_latest_roundtrip() {
    let pool = create_test_pool().await;
    let task = tasks::insert_task(&pool, &NewTask::new("t", "/tmp"))
        .await
        .unwrap();

    let new = NewCheckpoint {
        output_summary: Some("migration ran".to_string()),
        error_summary: None,
        git_branch: Some("feature/x".to_string()),
        git_commit_sha: Some("abc123".to_string()),
        git_dirty_files: Some(vec!["a.rs".to_string(), "b.rs".to_string()]),
    };
    let saved = checkpoints::insert_checkpoint(&pool, task.id, CheckpointType::Completed, &new)
        .await
        .unwrap();

    let latest = checkpoints::find_latest(&pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, saved.id);
    assert_eq!(latest.checkpoint_type, CheckpointType::Completed);
    assert_eq!(latest.output_summary.as_deref(), Some("migration ran"));
    assert!(latest.error_summary.is_none());
    assert_eq!(latest.git_branch.as_deref(), Some("feature/x"));
    assert_eq!(
        latest.git_dirty_files.as_ref().map(|j| j.0.clone()),
        Some(vec!["a.rs".to_string(), "b.rs".to_string()])
    );
}

#[tokio::test]
async fn find_latest_prefers_newest() {
    let pool = create_test_pool().await;
    let task = tasks::insert_task(&pool, &NewTask::new("t", "/tmp"))
        .await
        .unwrap();

    checkpoints::insert_checkpoint(
        &pool,
        task.id,
        CheckpointType::Failed,
        &NewCheckpoint {
            error_summary: Some("first attempt failed".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // Ensure a strictly later created_at for the second row.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let second = checkpoints::insert_checkpoint(
        &pool,
        task.id,
        CheckpointType::Completed,
        &NewCheckpoint {
            output_summary: Some("second attempt passed".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let latest = checkpoints::find_latest(&pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, second.id);

    let all = checkpoints::list_for_task(&pool, task.id).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, second.id);
}

#[tokio::test]
async fn find_latest_on_empty_is_none() {
    let pool = create_test_pool().await;
    let task = tasks::insert_task(&pool, &NewTask::new("t", "/tmp"))
        .await
        .unwrap();
    assert!(checkpoints::find_latest(&pool, task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_for_task_clears_all() {
    let pool = create_test_pool().await;
    let task = tasks::insert_task(&pool, &NewTask::new("t", "/tmp"))
        .await
        .unwrap();

    for _ in 0..3 {
        checkpoints::insert_checkpoint(
            &pool,
            task.id,
            CheckpointType::Failed,
            &NewCheckpoint::default(),
        )
        .await
        .unwrap();
    }

    let deleted = checkpoints::delete_for_task(&pool, task.id).await.unwrap();
    assert_eq!(deleted, 3);
    assert!(checkpoints::find_latest(&pool, task.id).await.unwrap().is_none());
}
