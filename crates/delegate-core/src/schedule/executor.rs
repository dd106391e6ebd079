//! The scheduler tick loop: find due schedules, apply the missed-run
//! policy, fire triggers.
//!
//! Lateness is `now - next_run_at` at tick time. `catchup` fires one
//! trigger per due tick regardless of lateness -- never a burst of
//! historical triggers; `next_run_at` advances past `now` in one step
//! when the trigger is handled. `skip` and `fail` suppress the instance
//! once lateness exceeds the grace period, record the decision, and
//! advance `next_run_at` themselves.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use delegate_db::models::{
    ExecutionStatus, MissedRunPolicy, Schedule, ScheduleStatus, ScheduleType,
};
use delegate_db::queries::schedules::{self, NewExecution};

use crate::config::DelegateConfig;
use crate::error::DelegateError;
use crate::events::{Event, EventBus};

use super::cron;

pub struct ScheduleExecutor {
    db: SqlitePool,
    bus: EventBus,
    check_interval: Duration,
    grace: chrono::Duration,
}

impl ScheduleExecutor {
    pub fn new(db: SqlitePool, bus: EventBus, config: &DelegateConfig) -> Self {
        Self {
            db,
            bus,
            check_interval: Duration::from_millis(config.schedule_check_interval_ms),
            grace: chrono::Duration::milliseconds(config.missed_run_grace_period_ms as i64),
        }
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("schedule executor running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick_once(Utc::now()).await {
                warn!(error = %e, "scheduler tick failed");
            }
        }
        info!("schedule executor stopped");
    }

    /// One tick at an explicit `now` (tests drive this directly).
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<(), DelegateError> {
        let due = schedules::find_due(&self.db, now).await?;
        for schedule in due {
            if let Err(e) = self.handle_due(&schedule, now).await {
                error!(schedule_id = %schedule.id, error = %e, "failed to process due schedule");
            }
        }
        Ok(())
    }

    async fn handle_due(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<(), DelegateError> {
        let scheduled_for = schedule
            .next_run_at
            .expect("find_due only returns schedules with next_run_at");
        let lateness = now - scheduled_for;
        let missed = lateness > self.grace;

        match schedule.missed_run_policy {
            MissedRunPolicy::Catchup => {}
            MissedRunPolicy::Skip if missed => {
                info!(
                    schedule_id = %schedule.id,
                    lateness_ms = lateness.num_milliseconds(),
                    "skipping missed run"
                );
                self.record_decision(schedule, scheduled_for, now, ExecutionStatus::Skipped, None)
                    .await?;
                self.advance_without_trigger(schedule, now).await?;
                return Ok(());
            }
            MissedRunPolicy::Fail if missed => {
                warn!(
                    schedule_id = %schedule.id,
                    lateness_ms = lateness.num_milliseconds(),
                    "recording failed run for missed schedule"
                );
                self.record_decision(
                    schedule,
                    scheduled_for,
                    now,
                    ExecutionStatus::Failed,
                    Some(format!(
                        "missed by {} ms (grace {} ms)",
                        lateness.num_milliseconds(),
                        self.grace.num_milliseconds()
                    )),
                )
                .await?;
                self.advance_without_trigger(schedule, now).await?;
                return Ok(());
            }
            MissedRunPolicy::Skip | MissedRunPolicy::Fail => {}
        }

        self.bus
            .emit(Event::ScheduleTriggered {
                schedule_id: schedule.id,
                triggered_at: now,
                scheduled_for,
            })
            .await;
        Ok(())
    }

    /// Advance `next_run_at` past `now` without firing. For a one-time
    /// schedule there is no next instant: its moment was missed, so it
    /// expires.
    async fn advance_without_trigger(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<(), DelegateError> {
        match schedule.schedule_type {
            ScheduleType::OneTime => {
                schedules::transition_status(
                    &self.db,
                    schedule.id,
                    ScheduleStatus::Active,
                    ScheduleStatus::Expired,
                    None,
                )
                .await?;
            }
            ScheduleType::Cron => {
                let next = match &schedule.cron_expression {
                    Some(expr) => {
                        match cron::next_occurrence(expr, &schedule.timezone, now) {
                            Ok(next) => next,
                            Err(e) => {
                                // next_run_at must still be written, cleared,
                                // or this schedule re-fires on every tick.
                                error!(schedule_id = %schedule.id, error = %e, "cron recompute failed");
                                None
                            }
                        }
                    }
                    None => None,
                };
                schedules::set_next_run(&self.db, schedule.id, next).await?;
            }
        }
        Ok(())
    }

    async fn record_decision(
        &self,
        schedule: &Schedule,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
        status: ExecutionStatus,
        error_message: Option<String>,
    ) -> Result<(), DelegateError> {
        // Audit writes are best-effort; failure is logged, not fatal.
        if let Err(e) = schedules::insert_execution(
            &self.db,
            &NewExecution {
                schedule_id: schedule.id,
                task_id: None,
                scheduled_for,
                executed_at: now,
                status,
                error_message,
            },
        )
        .await
        {
            error!(schedule_id = %schedule.id, error = %e, "failed to record execution audit row");
        }
        Ok(())
    }
}
