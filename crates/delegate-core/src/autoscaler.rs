//! Pulls work off the queue when resources permit.
//!
//! A single loop driven by a periodic tick plus nudges from `TaskQueued`
//! and `TaskUnblocked` events. Each pass asks the resource monitor first;
//! when admissible it scans the queue snapshot in priority order, skips
//! blocked candidates (so a permanently-blocked head never starves the
//! queue or spins the loop), and spawns at most one worker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use delegate_db::models::TaskStatus;
use delegate_db::queries::{dependencies, tasks};

use crate::config::DelegateConfig;
use crate::error::{DelegateError, ErrorKind};
use crate::events::{Event, EventBus, Topic};
use crate::monitor::ResourceMonitor;
use crate::queue::TaskQueue;
use crate::worker::WorkerPool;

pub struct Autoscaler {
    db: SqlitePool,
    bus: EventBus,
    queue: Arc<Mutex<TaskQueue>>,
    pool: WorkerPool,
    monitor: Arc<ResourceMonitor>,
    tick_interval: Duration,
}

impl Autoscaler {
    pub fn new(
        db: SqlitePool,
        bus: EventBus,
        queue: Arc<Mutex<TaskQueue>>,
        pool: WorkerPool,
        monitor: Arc<ResourceMonitor>,
        config: &DelegateConfig,
    ) -> Self {
        Self {
            db,
            bus,
            queue,
            pool,
            monitor,
            tick_interval: Duration::from_millis(config.resource_monitor_interval_ms),
        }
    }

    /// Run until cancelled. Subscribes to queue events for nudges between
    /// ticks; shutdown stops the ticker and refuses further spawns.
    pub async fn run(&self, cancel: CancellationToken) {
        let (nudge_tx, mut nudge_rx) = mpsc::channel::<()>(16);
        let mut handles = Vec::new();
        for topic in [Topic::TaskQueued, Topic::TaskUnblocked] {
            let tx = nudge_tx.clone();
            let result = self.bus.subscribe(topic, "autoscaler", move |_event, _replier| {
                let tx = tx.clone();
                Box::pin(async move {
                    // A full channel already guarantees a pass is coming.
                    let _ = tx.try_send(());
                    Ok(())
                })
            });
            match result {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(topic = %topic, error = %e, "autoscaler failed to subscribe"),
            }
        }

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("autoscaler running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = nudge_rx.recv() => {}
            }
            if let Err(e) = self.pass().await {
                warn!(error = %e, "autoscaler pass failed");
            }
        }

        for handle in handles {
            self.bus.unsubscribe(handle);
        }
        info!("autoscaler stopped");
    }

    /// One scheduling pass: spawn at most one worker.
    pub async fn pass(&self) -> Result<(), DelegateError> {
        if !self.monitor.can_spawn_worker() {
            return Ok(());
        }

        let candidates = self.queue.lock().expect("queue poisoned").snapshot();
        for candidate in candidates {
            if dependencies::is_blocked(&self.db, candidate.id)
                .await
                .map_err(DelegateError::from)?
            {
                debug!(task_id = %candidate.id, "skipping blocked task");
                continue;
            }

            match self.pool.spawn(&candidate).await {
                Ok(worker) => {
                    self.queue
                        .lock()
                        .expect("queue poisoned")
                        .remove(&candidate.id);
                    debug!(task_id = %candidate.id, worker_id = %worker.id, "dequeued and spawned");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::InsufficientResources => {
                    // Leave the task where it is; the next tick retries.
                    debug!(task_id = %candidate.id, "insufficient resources, leaving task queued");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::WorkerSpawnFailed => {
                    // The subprocess could not be launched at all; the
                    // task fails rather than clogging the queue head.
                    error!(task_id = %candidate.id, error = %e, "spawn failed, failing task");
                    self.queue
                        .lock()
                        .expect("queue poisoned")
                        .remove(&candidate.id);
                    let rows =
                        tasks::mark_terminal(&self.db, candidate.id, TaskStatus::Failed, None)
                            .await?;
                    if rows > 0 {
                        self.bus
                            .emit(Event::TaskFailed {
                                task_id: candidate.id,
                                error: e.to_string(),
                            })
                            .await;
                    }
                    return Ok(());
                }
                Err(e) => {
                    // e.g. the task was cancelled between snapshot and
                    // spawn; drop it from the queue and move on.
                    warn!(task_id = %candidate.id, error = %e, "dropping unspawnable task");
                    self.queue
                        .lock()
                        .expect("queue poisoned")
                        .remove(&candidate.id);
                    continue;
                }
            }
        }

        Ok(())
    }
}
