//! Schedule lifecycle operations and the `ScheduleTriggered` handler.
//!
//! On a trigger the handler reloads the schedule, materialises a task from
//! the template, records the audit row, re-delegates through the normal
//! path, and recomputes `next_run_at` -- which is ALWAYS written (a future
//! value or an explicit clear), so a parse failure can never leave a past
//! `next_run_at` behind to re-trigger on every tick.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use delegate_db::models::{
    ExecutionStatus, MissedRunPolicy, Schedule, ScheduleStatus, ScheduleType, TaskPriority,
    TaskTemplate,
};
use delegate_db::queries::schedules::{self, NewExecution, NewSchedule};

use crate::error::DelegateError;
use crate::events::{Event, EventBus, Topic};
use crate::handlers::{DelegateRequest, DelegationService};

use super::cron;

/// Fields for creating a schedule.
#[derive(Debug, Clone)]
pub struct CreateScheduleRequest {
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub missed_run_policy: MissedRunPolicy,
    pub task_template: TaskTemplate,
    pub priority: TaskPriority,
    pub max_runs: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ScheduleService {
    db: SqlitePool,
    bus: EventBus,
    delegation: DelegationService,
}

impl ScheduleService {
    pub fn new(db: SqlitePool, bus: EventBus, delegation: DelegationService) -> Self {
        Self {
            db,
            bus,
            delegation,
        }
    }

    /// Subscribe the trigger handler and the schedule query responder.
    pub fn register(&self) -> Result<(), DelegateError> {
        let service = self.clone();
        self.bus.subscribe(
            Topic::ScheduleTriggered,
            "schedule-handler",
            move |event, _replier| {
                let service = service.clone();
                Box::pin(async move {
                    if let Event::ScheduleTriggered {
                        schedule_id,
                        triggered_at,
                        scheduled_for,
                    } = event
                    {
                        service
                            .handle_trigger(schedule_id, triggered_at, scheduled_for)
                            .await?;
                    }
                    Ok(())
                })
            },
        )?;

        let service = self.clone();
        self.bus.subscribe(
            Topic::ScheduleQuery,
            "schedule-query",
            move |event, replier| {
                let service = service.clone();
                Box::pin(async move {
                    let Event::ScheduleQuery { status } = event else {
                        return Ok(());
                    };
                    match schedules::list_schedules(&service.db, status).await {
                        Ok(list) => replier.respond(serde_json::to_value(&list)?),
                        Err(e) => replier.respond_error(DelegateError::System(e)),
                    }
                    Ok(())
                })
            },
        )?;
        Ok(())
    }

    // -- lifecycle ---------------------------------------------------------

    /// Create and activate a schedule.
    pub async fn create(&self, request: CreateScheduleRequest) -> Result<Schedule, DelegateError> {
        cron::parse_timezone(&request.timezone)?;
        if let Some(max_runs) = request.max_runs {
            if max_runs < 1 {
                return Err(DelegateError::InvalidInput(format!(
                    "maxRuns must be at least 1, got {max_runs}"
                )));
            }
        }
        if request.task_template.prompt.trim().is_empty() {
            return Err(DelegateError::InvalidInput(
                "task template prompt is empty".to_string(),
            ));
        }

        let now = Utc::now();
        let next_run_at = match request.schedule_type {
            ScheduleType::Cron => {
                let expr = request.cron_expression.as_deref().ok_or_else(|| {
                    DelegateError::InvalidInput(
                        "cron schedules need a cron expression".to_string(),
                    )
                })?;
                cron::validate_expression(expr)?;
                cron::next_occurrence(expr, &request.timezone, now)?
            }
            ScheduleType::OneTime => {
                let at = request.scheduled_at.ok_or_else(|| {
                    DelegateError::InvalidInput(
                        "one-time schedules need a scheduled time".to_string(),
                    )
                })?;
                if at <= now {
                    return Err(DelegateError::InvalidInput(format!(
                        "scheduled time {at} is not in the future"
                    )));
                }
                Some(at)
            }
        };

        let schedule = schedules::insert_schedule(
            &self.db,
            &NewSchedule {
                schedule_type: request.schedule_type,
                cron_expression: request.cron_expression,
                scheduled_at: request.scheduled_at,
                timezone: request.timezone,
                missed_run_policy: request.missed_run_policy,
                task_template: request.task_template,
                priority: request.priority,
                max_runs: request.max_runs,
                next_run_at,
                expires_at: request.expires_at,
            },
        )
        .await?;

        info!(schedule_id = %schedule.id, schedule_type = %schedule.schedule_type, "schedule created");
        self.bus
            .emit(Event::ScheduleCreated {
                schedule_id: schedule.id,
            })
            .await;
        Ok(schedule)
    }

    /// Pause an active schedule.
    pub async fn pause(&self, id: Uuid) -> Result<(), DelegateError> {
        let rows = schedules::transition_status(
            &self.db,
            id,
            ScheduleStatus::Active,
            ScheduleStatus::Paused,
            None,
        )
        .await?;
        if rows == 0 {
            return Err(self.transition_error(id, "pause").await);
        }
        self.bus.emit(Event::SchedulePaused { schedule_id: id }).await;
        Ok(())
    }

    /// Resume a paused schedule, recomputing `next_run_at`.
    pub async fn resume(&self, id: Uuid) -> Result<(), DelegateError> {
        let schedule = schedules::get_schedule(&self.db, id)
            .await?
            .ok_or_else(|| DelegateError::InvalidOperation(format!("schedule {id} not found")))?;

        let next_run_at = match schedule.schedule_type {
            ScheduleType::Cron => match &schedule.cron_expression {
                Some(expr) => cron::next_occurrence(expr, &schedule.timezone, Utc::now())?,
                None => None,
            },
            ScheduleType::OneTime => schedule.scheduled_at,
        };

        let rows = schedules::transition_status(
            &self.db,
            id,
            ScheduleStatus::Paused,
            ScheduleStatus::Active,
            next_run_at,
        )
        .await?;
        if rows == 0 {
            return Err(self.transition_error(id, "resume").await);
        }
        self.bus.emit(Event::ScheduleResumed { schedule_id: id }).await;
        Ok(())
    }

    /// Cancel an active or paused schedule.
    pub async fn cancel(&self, id: Uuid) -> Result<(), DelegateError> {
        for from in [ScheduleStatus::Active, ScheduleStatus::Paused] {
            let rows =
                schedules::transition_status(&self.db, id, from, ScheduleStatus::Cancelled, None)
                    .await?;
            if rows > 0 {
                self.bus.emit(Event::ScheduleCancelled { schedule_id: id }).await;
                return Ok(());
            }
        }
        Err(self.transition_error(id, "cancel").await)
    }

    async fn transition_error(&self, id: Uuid, op: &str) -> DelegateError {
        match schedules::get_schedule(&self.db, id).await {
            Ok(Some(s)) => DelegateError::InvalidOperation(format!(
                "cannot {op} schedule {id}: status is {}",
                s.status
            )),
            Ok(None) => DelegateError::InvalidOperation(format!("schedule {id} not found")),
            Err(e) => DelegateError::System(e),
        }
    }

    // -- trigger handling --------------------------------------------------

    /// Handle one `ScheduleTriggered` event.
    pub async fn handle_trigger(
        &self,
        schedule_id: Uuid,
        triggered_at: DateTime<Utc>,
        scheduled_for: DateTime<Utc>,
    ) -> Result<(), DelegateError> {
        // Reload: the schedule may have been paused or cancelled between
        // the tick and this handler running.
        let Some(schedule) = schedules::get_schedule(&self.db, schedule_id).await? else {
            warn!(schedule_id = %schedule_id, "triggered schedule no longer exists");
            return Ok(());
        };
        if schedule.status != ScheduleStatus::Active {
            info!(
                schedule_id = %schedule_id,
                status = %schedule.status,
                "ignoring trigger for non-active schedule"
            );
            return Ok(());
        }

        // Materialise the task from the template.
        let template: &TaskTemplate = &schedule.task_template.0;
        let task = self
            .delegation
            .delegate(DelegateRequest {
                prompt: template.prompt.clone(),
                priority: schedule.priority,
                working_directory: template.working_directory.clone(),
                use_worktree: template.use_worktree,
                timeout_ms: template.timeout_ms,
                depends_on: Vec::new(),
                chain: None,
            })
            .await;

        let (task_id, execution_status, error_message) = match &task {
            Ok(task) => (Some(task.id), ExecutionStatus::Triggered, None),
            Err(e) => {
                error!(schedule_id = %schedule_id, error = %e, "failed to materialise scheduled task");
                (None, ExecutionStatus::Failed, Some(e.to_string()))
            }
        };

        // Audit row; failure to record is logged but non-fatal.
        if let Err(e) = schedules::insert_execution(
            &self.db,
            &NewExecution {
                schedule_id,
                task_id,
                scheduled_for,
                executed_at: triggered_at,
                status: execution_status,
                error_message,
            },
        )
        .await
        {
            error!(schedule_id = %schedule_id, error = %e, "failed to record execution audit row");
        }

        // Recompute next_run_at and the resulting status; a single UPDATE
        // always includes next_run_at.
        let run_count_after = schedule.run_count + 1;
        let (next_run_at, status) = match schedule.schedule_type {
            ScheduleType::OneTime => (None, ScheduleStatus::Completed),
            ScheduleType::Cron => {
                let next = match &schedule.cron_expression {
                    Some(expr) => {
                        match cron::next_occurrence(expr, &schedule.timezone, triggered_at) {
                            Ok(next) => next,
                            Err(e) => {
                                error!(schedule_id = %schedule_id, error = %e, "cron recompute failed; clearing next run");
                                None
                            }
                        }
                    }
                    None => None,
                };
                let status = if schedule.max_runs.is_some_and(|max| run_count_after >= max) {
                    ScheduleStatus::Completed
                } else if schedule.expires_at.is_some_and(|at| at <= triggered_at) {
                    ScheduleStatus::Expired
                } else {
                    ScheduleStatus::Active
                };
                (next, status)
            }
        };
        schedules::record_run(&self.db, schedule_id, triggered_at, next_run_at, status).await?;

        self.bus
            .emit(Event::ScheduleExecuted {
                schedule_id,
                task_id,
            })
            .await;

        // Surface delegation failures to the caller after bookkeeping.
        task.map(|_| ())
    }
}
