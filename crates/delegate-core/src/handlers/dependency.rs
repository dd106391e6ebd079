//! Reacts to task terminal events: resolves dependency edges and unblocks
//! dependents.
//!
//! Resolution mapping: completed -> `completed`; failed and timeout ->
//! `failed`; cancelled -> `cancelled`. Every newly-unblocked dependent is
//! flipped from `blocked` to `queued` and announced with `TaskUnblocked`
//! so the autoscaler reconsiders it.

use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use delegate_db::models::{DependencyResolution, TaskStatus};
use delegate_db::queries::{dependencies, tasks};

use crate::error::DelegateError;
use crate::events::{Event, EventBus, Topic};
use crate::graph::DependencyGraph;

#[derive(Clone)]
pub struct DependencyHandler {
    db: SqlitePool,
    bus: EventBus,
    graph: Arc<Mutex<DependencyGraph>>,
}

impl DependencyHandler {
    pub fn new(db: SqlitePool, bus: EventBus, graph: Arc<Mutex<DependencyGraph>>) -> Self {
        Self { db, bus, graph }
    }

    /// Subscribe to all four terminal topics.
    pub fn register(&self) -> Result<(), DelegateError> {
        for topic in Topic::TASK_TERMINAL {
            let handler = self.clone();
            self.bus.subscribe(topic, "dependency-handler", move |event, _replier| {
                let handler = handler.clone();
                Box::pin(async move {
                    handler.on_terminal(&event).await?;
                    Ok(())
                })
            })?;
        }
        Ok(())
    }

    async fn on_terminal(&self, event: &Event) -> Result<(), DelegateError> {
        let (task_id, resolution) = match event {
            Event::TaskCompleted { task_id, .. } => (*task_id, DependencyResolution::Completed),
            Event::TaskFailed { task_id, .. } | Event::TaskTimeout { task_id, .. } => {
                (*task_id, DependencyResolution::Failed)
            }
            Event::TaskCancelled { task_id } => (*task_id, DependencyResolution::Cancelled),
            _ => return Ok(()),
        };
        self.resolve(task_id, resolution).await
    }

    /// Resolve every pending edge naming `task_id` as the dependency and
    /// unblock dependents whose last pending edge just resolved.
    pub async fn resolve(
        &self,
        task_id: Uuid,
        resolution: DependencyResolution,
    ) -> Result<(), DelegateError> {
        let resolved = dependencies::resolve_batch(&self.db, task_id, resolution)
            .await
            .map_err(DelegateError::from)?;
        if resolved == 0 {
            self.graph.lock().expect("graph poisoned").remove_task(task_id);
            return Ok(());
        }
        debug!(task_id = %task_id, resolution = %resolution, resolved, "resolved dependency edges");

        let unblocked = dependencies::newly_unblocked(&self.db, task_id)
            .await
            .map_err(DelegateError::from)?;
        self.graph.lock().expect("graph poisoned").remove_task(task_id);

        for dependent in unblocked {
            let rows = tasks::transition_status(
                &self.db,
                dependent,
                TaskStatus::Blocked,
                TaskStatus::Queued,
            )
            .await?;
            if rows > 0 {
                info!(task_id = %dependent, "task unblocked");
                self.bus.emit(Event::TaskUnblocked { task_id: dependent }).await;
            }
        }
        Ok(())
    }
}
