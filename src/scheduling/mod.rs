//! Scheduling Module
//!
//! Periodic triggering of stored workflows.
//!
//! - [`scheduler`]: the lock-guarded loop that starts due scheduled workflows

pub mod scheduler;

pub use scheduler::{Scheduler, SchedulerReport, SCHEDULER_LOCK};
