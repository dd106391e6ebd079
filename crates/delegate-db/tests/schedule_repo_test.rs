//! Integration tests for the schedule and execution repositories.

use chrono::{Duration, Utc};
use uuid::Uuid;

use delegate_db::models::{
    ExecutionStatus, MissedRunPolicy, ScheduleStatus, ScheduleType, TaskPriority, TaskTemplate,
};
use delegate_db::queries::schedules::{self, NewExecution, NewSchedule};
use delegate_test_utils::create_test_pool;

fn cron_schedule(next_run_at: Option<chrono::DateTime<Utc>>) -> NewSchedule {
    NewSchedule {
        schedule_type: ScheduleType::Cron,
        cron_expression: Some("* * * * *".to_string()),
        scheduled_at: None,
        timezone: "UTC".to_string(),
        missed_run_policy: MissedRunPolicy::Catchup,
        task_template: TaskTemplate {
            prompt: "nightly sweep".to_string(),
            working_directory: "/srv/project".to_string(),
            use_worktree: false,
            timeout_ms: None,
        },
        priority: TaskPriority::P1,
        max_runs: None,
        next_run_at,
        expires_at: None,
    }
}

#[tokio::test]
async fn insert_and_fetch_roundtrip() {
    let pool = create_test_pool().await;
    let next = Utc::now() + Duration::minutes(1);

    let schedule = schedules::insert_schedule(&pool, &cron_schedule(Some(next)))
        .await
        .unwrap();
    let found = schedules::get_schedule(&pool, schedule.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(found.schedule_type, ScheduleType::Cron);
    assert_eq!(found.cron_expression.as_deref(), Some("* * * * *"));
    assert_eq!(found.timezone, "UTC");
    assert_eq!(found.status, ScheduleStatus::Active);
    assert_eq!(found.missed_run_policy, MissedRunPolicy::Catchup);
    assert_eq!(found.task_template.0.prompt, "nightly sweep");
    assert_eq!(found.run_count, 0);
    assert!(found.last_run_at.is_none());
    assert!(found.next_run_at.is_some());
}

#[tokio::test]
async fn find_due_only_returns_past_active() {
    let pool = create_test_pool().await;
    let now = Utc::now();

    let due = schedules::insert_schedule(&pool, &cron_schedule(Some(now - Duration::seconds(5))))
        .await
        .unwrap();
    let future =
        schedules::insert_schedule(&pool, &cron_schedule(Some(now + Duration::minutes(5))))
            .await
            .unwrap();
    let paused = schedules::insert_schedule(&pool, &cron_schedule(Some(now - Duration::seconds(5))))
        .await
        .unwrap();
    schedules::transition_status(&pool, paused.id, ScheduleStatus::Active, ScheduleStatus::Paused, None)
        .await
        .unwrap();

    let found = schedules::find_due(&pool, now).await.unwrap();
    let ids: Vec<Uuid> = found.iter().map(|s| s.id).collect();
    assert!(ids.contains(&due.id));
    assert!(!ids.contains(&future.id));
    assert!(!ids.contains(&paused.id));
}

#[tokio::test]
async fn record_run_advances_counters_and_next() {
    let pool = create_test_pool().await;
    let now = Utc::now();
    let schedule = schedules::insert_schedule(&pool, &cron_schedule(Some(now)))
        .await
        .unwrap();

    let next = now + Duration::minutes(1);
    schedules::record_run(&pool, schedule.id, now, Some(next), ScheduleStatus::Active)
        .await
        .unwrap();

    let found = schedules::get_schedule(&pool, schedule.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.run_count, 1);
    assert!(found.last_run_at.is_some());
    assert_eq!(found.status, ScheduleStatus::Active);
    assert!(found.next_run_at.unwrap() > now);
}

#[tokio::test]
async fn record_run_into_completed_clears_next() {
    let pool = create_test_pool().await;
    let now = Utc::now();
    let schedule = schedules::insert_schedule(&pool, &cron_schedule(Some(now)))
        .await
        .unwrap();

    // Even if a (stale) next value is passed, a non-active status wins and
    // next_run_at is cleared.
    schedules::record_run(
        &pool,
        schedule.id,
        now,
        Some(now + Duration::minutes(1)),
        ScheduleStatus::Completed,
    )
    .await
    .unwrap();

    let found = schedules::get_schedule(&pool, schedule.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.status, ScheduleStatus::Completed);
    assert_eq!(found.run_count, 1);
    assert!(found.next_run_at.is_none());
}

#[tokio::test]
async fn pause_then_resume_restores_active_with_future_next() {
    let pool = create_test_pool().await;
    let now = Utc::now();
    let schedule = schedules::insert_schedule(&pool, &cron_schedule(Some(now)))
        .await
        .unwrap();

    let rows = schedules::transition_status(
        &pool,
        schedule.id,
        ScheduleStatus::Active,
        ScheduleStatus::Paused,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);
    let paused = schedules::get_schedule(&pool, schedule.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, ScheduleStatus::Paused);
    assert!(paused.next_run_at.is_none());

    let future = now + Duration::minutes(1);
    let rows = schedules::transition_status(
        &pool,
        schedule.id,
        ScheduleStatus::Paused,
        ScheduleStatus::Active,
        Some(future),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);
    let resumed = schedules::get_schedule(&pool, schedule.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resumed.status, ScheduleStatus::Active);
    assert!(resumed.next_run_at.unwrap() > now);
}

#[tokio::test]
async fn transition_with_wrong_from_is_noop() {
    let pool = create_test_pool().await;
    let schedule = schedules::insert_schedule(&pool, &cron_schedule(Some(Utc::now())))
        .await
        .unwrap();

    // Schedule is active, so resuming from paused must not match.
    let rows = schedules::transition_status(
        &pool,
        schedule.id,
        ScheduleStatus::Paused,
        ScheduleStatus::Active,
        Some(Utc::now() + Duration::minutes(1)),
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn execution_audit_roundtrip() {
    let pool = create_test_pool().await;
    let schedule = schedules::insert_schedule(&pool, &cron_schedule(Some(Utc::now())))
        .await
        .unwrap();

    let now = Utc::now();
    let task_id = Uuid::new_v4();
    schedules::insert_execution(
        &pool,
        &NewExecution {
            schedule_id: schedule.id,
            task_id: Some(task_id),
            scheduled_for: now - Duration::seconds(3),
            executed_at: now,
            status: ExecutionStatus::Triggered,
            error_message: None,
        },
    )
    .await
    .unwrap();
    schedules::insert_execution(
        &pool,
        &NewExecution {
            schedule_id: schedule.id,
            task_id: None,
            scheduled_for: now,
            executed_at: now,
            status: ExecutionStatus::Failed,
            error_message: Some("cron parse failed".to_string()),
        },
    )
    .await
    .unwrap();

    let executions = schedules::list_executions(&pool, schedule.id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, ExecutionStatus::Triggered);
    assert_eq!(executions[0].task_id, Some(task_id));
    assert_eq!(executions[1].status, ExecutionStatus::Failed);
    assert_eq!(
        executions[1].error_message.as_deref(),
        Some("cron parse failed")
    );
}

#[tokio::test]
async fn list_schedules_filters_by_status() {
    let pool = create_test_pool().await;
    let a = schedules::insert_schedule(&pool, &cron_schedule(Some(Utc::now())))
        .await
        .unwrap();
    let b = schedules::insert_schedule(&pool, &cron_schedule(Some(Utc::now())))
        .await
        .unwrap();
    schedules::transition_status(&pool, b.id, ScheduleStatus::Active, ScheduleStatus::Cancelled, None)
        .await
        .unwrap();

    let active = schedules::list_schedules(&pool, Some(ScheduleStatus::Active))
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, a.id);

    let all = schedules::list_schedules(&pool, None).await.unwrap();
    assert_eq!(all.len(), 2);
}
