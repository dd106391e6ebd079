//! Time-based scheduling: cron parsing, the due-tick executor, and the
//! trigger/lifecycle service.

pub mod cron;
pub mod executor;
pub mod handler;

pub use executor::ScheduleExecutor;
pub use handler::{CreateScheduleRequest, ScheduleService};
