//! The delegate task-execution kernel.
//!
//! Event bus, priority queue, dependency graph, resource-gated worker
//! pool, autoscaler, cron scheduler, checkpoint/resume, and crash
//! recovery -- wired together by [`container::Container`] over the
//! persistence layer in `delegate-db`.

pub mod autoscaler;
pub mod capture;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod graph;
pub mod handlers;
pub mod monitor;
pub mod queue;
pub mod recovery;
pub mod resume;
pub mod retry;
pub mod schedule;
pub mod spawner;
pub mod worker;
