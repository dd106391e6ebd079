//! Dependency wiring and graceful shutdown.
//!
//! `Container::boot` builds the whole kernel: database pool, event bus,
//! queue, graph, monitor, capture, worker pool, autoscaler, schedule
//! executor, and all handlers -- then runs the recovery pass before
//! returning, so no delegation is serviced until recovery completes.
//!
//! `dispose` shuts down cooperatively: stop the tickers, let in-flight
//! handlers settle, kill the workers with the grace discipline, close the
//! database.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use delegate_db::config::DbConfig;
use delegate_db::queries::tasks;
use delegate_db::pool as db_pool;

use crate::autoscaler::Autoscaler;
use crate::capture::OutputCapture;
use crate::config::DelegateConfig;
use crate::events::bus::BusLimits;
use crate::events::{Event, EventBus};
use crate::graph::DependencyGraph;
use crate::handlers::checkpoint::CheckpointHandler;
use crate::handlers::dependency::DependencyHandler;
use crate::handlers::logs::LogsHandler;
use crate::handlers::DelegationService;
use crate::monitor::{MonitorConfig, ResourceMonitor};
use crate::queue::TaskQueue;
use crate::recovery::{self, RecoverySummary};
use crate::resume::ResumeService;
use crate::schedule::{ScheduleExecutor, ScheduleService};
use crate::spawner::{AgentSpawner, ProcessSpawner};
use crate::worker::{WorkerPool, WorkerPoolConfig};

pub struct Container {
    pub config: DelegateConfig,
    pub db: SqlitePool,
    pub bus: EventBus,
    pub queue: Arc<Mutex<TaskQueue>>,
    pub graph: Arc<Mutex<DependencyGraph>>,
    pub monitor: Arc<ResourceMonitor>,
    pub capture: Arc<OutputCapture>,
    pub worker_pool: WorkerPool,
    pub delegation: DelegationService,
    pub schedules: ScheduleService,
    pub resume: ResumeService,
    pub recovery: RecoverySummary,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Container {
    /// Boot with the default agent spawner.
    pub async fn boot(config: DelegateConfig) -> Result<Container> {
        Self::boot_with_spawner(config, Arc::new(AgentSpawner::new())).await
    }

    /// Boot with an explicit spawner (tests inject fakes here).
    pub async fn boot_with_spawner(
        config: DelegateConfig,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Result<Container> {
        let db_config = DbConfig::new(config.database_path.clone());
        let db = db_pool::create_pool(&db_config).await?;

        let bus = EventBus::new(BusLimits {
            max_listeners_per_event: config.max_listeners_per_event,
            max_total_subscriptions: config.max_total_subscriptions,
            request_timeout: Duration::from_millis(config.event_request_timeout_ms),
        });
        let queue = Arc::new(Mutex::new(TaskQueue::new(config.max_queue_size)));
        let graph = Arc::new(Mutex::new(DependencyGraph::new()));
        let monitor = Arc::new(ResourceMonitor::new(MonitorConfig::from(&config)));
        let capture = Arc::new(OutputCapture::new(&config, db_config.output_dir()));

        let worker_pool = WorkerPool::new(
            db.clone(),
            bus.clone(),
            Arc::clone(&capture),
            Arc::clone(&monitor),
            spawner,
            WorkerPoolConfig::from(&config),
        );
        let delegation = DelegationService::new(
            db.clone(),
            bus.clone(),
            Arc::clone(&queue),
            Arc::clone(&graph),
            worker_pool.clone(),
        );
        let schedules = ScheduleService::new(db.clone(), bus.clone(), delegation.clone());
        let resume = ResumeService::new(db.clone(), bus.clone(), delegation.clone());

        // Handlers before recovery would react to recovery's own events;
        // recovery runs first and the queue state is rebuilt silently.
        let recovery = recovery::run_recovery(&db, &queue, &graph, &bus).await?;

        DependencyHandler::new(db.clone(), bus.clone(), Arc::clone(&graph)).register()?;
        CheckpointHandler::new(db.clone(), bus.clone()).register()?;
        LogsHandler::new(db.clone(), bus.clone(), Arc::clone(&capture)).register()?;
        schedules.register()?;

        let cancel = CancellationToken::new();
        let mut loops = Vec::new();

        let autoscaler = Autoscaler::new(
            db.clone(),
            bus.clone(),
            Arc::clone(&queue),
            worker_pool.clone(),
            Arc::clone(&monitor),
            &config,
        );
        let autoscaler_cancel = cancel.clone();
        loops.push(tokio::spawn(async move {
            autoscaler.run(autoscaler_cancel).await;
        }));

        let executor = ScheduleExecutor::new(db.clone(), bus.clone(), &config);
        let executor_cancel = cancel.clone();
        loops.push(tokio::spawn(async move {
            executor.run(executor_cancel).await;
        }));

        let cleanup_bus = bus.clone();
        let cleanup_interval = Duration::from_millis(config.event_cleanup_interval_ms);
        let cleanup_cancel = cancel.clone();
        loops.push(tokio::spawn(async move {
            cleanup_bus.run_cleanup(cleanup_interval, cleanup_cancel).await;
        }));

        let retention_db = db.clone();
        let retention_days = config.task_retention_days as i64;
        let retention_cancel = cancel.clone();
        loops.push(tokio::spawn(async move {
            run_retention(retention_db, retention_days, retention_cancel).await;
        }));

        info!(
            requeued = recovery.requeued,
            failed_stale = recovery.failed_stale,
            "delegate container booted"
        );

        Ok(Container {
            config,
            db,
            bus,
            queue,
            graph,
            monitor,
            capture,
            worker_pool,
            delegation,
            schedules,
            resume,
            recovery,
            cancel,
            loops: Mutex::new(loops),
        })
    }

    /// Cooperative shutdown. Safe to call once; later calls are no-ops.
    pub async fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("shutting down");
        self.bus.emit(Event::ShutdownInitiated).await;

        // Stop the tickers and wait for their loops to finish their
        // in-flight handler work.
        self.cancel.cancel();
        let loops: Vec<JoinHandle<()>> =
            self.loops.lock().expect("loops poisoned").drain(..).collect();
        if tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(loops))
            .await
            .is_err()
        {
            warn!("background loops did not stop within 10s");
        }

        // Kill-all with the grace discipline; emits WorkersTerminating.
        self.worker_pool.kill_all().await;

        self.bus.emit(Event::DatabaseClosing).await;
        self.db.close().await;
        info!("shutdown complete");
    }
}

/// Daily retention sweep: delete terminal tasks older than the window.
async fn run_retention(db: SqlitePool, retention_days: i64, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        match tasks::delete_terminal_older_than(&db, cutoff).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "retention sweep removed old tasks"),
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
    }
}
