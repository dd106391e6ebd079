//! End-to-end: delegate through a booted container and watch tasks flow
//! queue -> worker -> terminal event -> dependency resolution.

mod common;

use std::sync::Arc;
use std::time::Duration;

use delegate_core::container::Container;
use delegate_core::error::ErrorKind;
use delegate_core::events::{Event, Topic};
use delegate_core::handlers::DelegateRequest;
use delegate_db::models::{TaskPriority, TaskStatus};
use delegate_db::queries::{dependencies, tasks};

use common::{collect_events, wait_for_terminal, wait_until, FakeBehavior, FakeSpawner};

async fn boot_with(spawner: FakeSpawner) -> (Container, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let config = common::test_config(tmp.path());
    let container = Container::boot_with_spawner(config, Arc::new(spawner))
        .await
        .unwrap();
    (container, tmp)
}

#[tokio::test]
async fn delegated_task_runs_to_completion() {
    let spawner = FakeSpawner::new();
    let (container, tmp) = boot_with(spawner.clone()).await;
    let events = collect_events(
        &container.bus,
        &[Topic::TaskDelegated, Topic::TaskQueued, Topic::WorkerSpawned, Topic::TaskCompleted],
    );

    let task = container
        .delegation
        .delegate(DelegateRequest::new(
            "build the feature",
            tmp.path().to_string_lossy().into_owned(),
        ))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    let finished = wait_for_terminal(&container.db, task.id, Duration::from_secs(10))
        .await
        .expect("task did not finish");
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(spawner.spawn_count(), 1);

    // The queue is drained.
    assert!(container.queue.lock().unwrap().is_empty());

    // Full event trail, in causal order.
    assert!(
        wait_until(Duration::from_secs(2), || {
            let collected = events.lock().unwrap();
            collected
                .iter()
                .any(|e| matches!(e, Event::TaskCompleted { .. }))
        })
        .await
    );
    let collected = events.lock().unwrap();
    let topics: Vec<Topic> = collected.iter().map(|e| e.topic()).collect();
    assert_eq!(topics[0], Topic::TaskDelegated);
    assert_eq!(topics[1], Topic::TaskQueued);
    assert!(topics.contains(&Topic::WorkerSpawned));
    assert!(topics.contains(&Topic::TaskCompleted));

    container.dispose().await;
}

#[tokio::test]
async fn dependent_task_waits_for_dependency() {
    let spawner = FakeSpawner::with_default_behavior(FakeBehavior {
        run_for: Duration::from_millis(100),
        ..Default::default()
    });
    let (container, tmp) = boot_with(spawner).await;
    let events = collect_events(&container.bus, &[Topic::TaskUnblocked]);
    let dir = tmp.path().to_string_lossy().into_owned();

    let first = container
        .delegation
        .delegate(DelegateRequest::new("produce the schema", dir.clone()))
        .await
        .unwrap();

    let mut request = DelegateRequest::new("consume the schema", dir);
    request.depends_on = vec![first.id];
    let second = container.delegation.delegate(request).await.unwrap();
    assert_eq!(second.status, TaskStatus::Blocked);
    assert!(dependencies::is_blocked(&container.db, second.id).await.unwrap());

    // The dependent may not run before its dependency resolves.
    let first_done = wait_for_terminal(&container.db, first.id, Duration::from_secs(10))
        .await
        .expect("dependency never finished");
    assert_eq!(first_done.status, TaskStatus::Completed);

    let second_done = wait_for_terminal(&container.db, second.id, Duration::from_secs(10))
        .await
        .expect("dependent never finished");
    assert_eq!(second_done.status, TaskStatus::Completed);
    assert!(
        second_done.started_at.unwrap() >= first_done.completed_at.unwrap(),
        "dependent started before its dependency resolved"
    );

    // Edge resolved, unblock announced.
    let edges = dependencies::list_for_task(&container.db, second.id).await.unwrap();
    assert_eq!(
        edges[0].resolution,
        delegate_db::models::DependencyResolution::Completed
    );
    let collected = events.lock().unwrap();
    assert!(collected
        .iter()
        .any(|e| matches!(e, Event::TaskUnblocked { task_id } if *task_id == second.id)));
    drop(collected);

    container.dispose().await;
}

#[tokio::test]
async fn failed_dependency_marks_edge_failed() {
    let spawner = FakeSpawner::with_default_behavior(FakeBehavior {
        exit_code: 2,
        run_for: Duration::from_millis(50),
        ..Default::default()
    });
    let (container, tmp) = boot_with(spawner).await;
    let dir = tmp.path().to_string_lossy().into_owned();

    let first = container
        .delegation
        .delegate(DelegateRequest::new("will fail", dir.clone()))
        .await
        .unwrap();
    let mut request = DelegateRequest::new("downstream", dir);
    request.depends_on = vec![first.id];
    let second = container.delegation.delegate(request).await.unwrap();

    let first_done = wait_for_terminal(&container.db, first.id, Duration::from_secs(10))
        .await
        .expect("dependency never finished");
    assert_eq!(first_done.status, TaskStatus::Failed);

    // Failed resolution still unblocks the dependent; it runs (and, with
    // this spawner, fails too).
    wait_for_terminal(&container.db, second.id, Duration::from_secs(10))
        .await
        .expect("dependent never finished");
    let edges = dependencies::list_for_task(&container.db, second.id).await.unwrap();
    assert_eq!(
        edges[0].resolution,
        delegate_db::models::DependencyResolution::Failed
    );

    container.dispose().await;
}

#[tokio::test]
async fn delegate_rejects_bad_input() {
    let (container, tmp) = boot_with(FakeSpawner::new()).await;
    let dir = tmp.path().to_string_lossy().into_owned();

    let err = container
        .delegation
        .delegate(DelegateRequest::new("   ", dir.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = container
        .delegation
        .delegate(DelegateRequest::new("ok", ""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let mut request = DelegateRequest::new("ok", dir);
    request.depends_on = vec![uuid::Uuid::new_v4()];
    let err = container.delegation.delegate(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TaskNotFound);

    container.dispose().await;
}

#[tokio::test]
async fn cancel_queued_task() {
    // A slow first task occupies the (throttled) pool while the second
    // sits in the queue, where cancel can reach it.
    let spawner = FakeSpawner::with_default_behavior(FakeBehavior {
        run_for: Duration::from_secs(600),
        ..Default::default()
    });
    let tmp = tempfile::tempdir().unwrap();
    let mut config = common::test_config(tmp.path());
    // Throttle after the first spawn so the second task stays queued.
    config.min_spawn_delay_ms = 600_000;
    let container = Container::boot_with_spawner(config, Arc::new(spawner))
        .await
        .unwrap();
    let dir = tmp.path().to_string_lossy().into_owned();

    let running = container
        .delegation
        .delegate(DelegateRequest::new("long runner", dir.clone()))
        .await
        .unwrap();
    // Wait until the first task is actually running.
    assert!(
        wait_until(Duration::from_secs(5), || {
            !container.worker_pool.live_workers().is_empty()
        })
        .await
    );

    let queued = container
        .delegation
        .delegate(DelegateRequest::new("stuck in line", dir))
        .await
        .unwrap();

    container.delegation.cancel(queued.id).await.unwrap();
    let cancelled = tasks::get_task(&container.db, queued.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(!container.queue.lock().unwrap().contains(&queued.id));

    // Cancelling a terminal task is rejected.
    let err = container.delegation.cancel(queued.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    // Cancel the running task through the worker pool path.
    container.delegation.cancel(running.id).await.unwrap();
    let done = wait_for_terminal(&container.db, running.id, Duration::from_secs(10))
        .await
        .expect("running task never cancelled");
    assert_eq!(done.status, TaskStatus::Cancelled);

    container.dispose().await;
}

#[tokio::test]
async fn logs_request_returns_captured_output() {
    let spawner = FakeSpawner::with_default_behavior(FakeBehavior {
        stdout: vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()],
        ..Default::default()
    });
    let (container, tmp) = boot_with(spawner).await;

    let task = container
        .delegation
        .delegate(DelegateRequest::new(
            "chatty",
            tmp.path().to_string_lossy().into_owned(),
        ))
        .await
        .unwrap();
    wait_for_terminal(&container.db, task.id, Duration::from_secs(10))
        .await
        .expect("task never finished");

    let value = container
        .bus
        .request(
            Event::LogsRequested {
                task_id: task.id,
                tail: Some(2),
            },
            None,
        )
        .await
        .unwrap();
    let stdout: Vec<String> = serde_json::from_value(value["stdout"].clone()).unwrap();
    assert_eq!(stdout, vec!["beta", "gamma"]);

    container.dispose().await;
}

#[tokio::test]
async fn priority_ordering_is_respected_across_delegations() {
    // An unsatisfiable memory reserve keeps the autoscaler from spawning
    // anything, so the queue order itself can be asserted.
    let tmp = tempfile::tempdir().unwrap();
    let mut config = common::test_config(tmp.path());
    config.memory_reserve = u64::MAX;
    let container = Container::boot_with_spawner(config, Arc::new(FakeSpawner::new()))
        .await
        .unwrap();
    let dir = tmp.path().to_string_lossy().into_owned();

    let mut delegated = Vec::new();
    for (prompt, priority) in [
        ("p2 task", TaskPriority::P2),
        ("p0 first", TaskPriority::P0),
        ("p1 task", TaskPriority::P1),
        ("p0 second", TaskPriority::P0),
    ] {
        let mut request = DelegateRequest::new(prompt, dir.clone());
        request.priority = priority;
        delegated.push(container.delegation.delegate(request).await.unwrap());
    }

    let snapshot = container.queue.lock().unwrap().snapshot();
    let prompts: Vec<&str> = snapshot.iter().map(|t| t.prompt.as_str()).collect();
    assert_eq!(prompts, vec!["p0 first", "p0 second", "p1 task", "p2 task"]);

    container.dispose().await;
}
