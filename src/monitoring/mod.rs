//! Monitoring Module
//!
//! Detection and recovery of executions whose owner stopped reporting.
//!
//! # Components
//!
//! - [`FailsafeMonitor`]: heartbeat-based stuck-execution recoverer

pub mod failsafe;

pub use failsafe::{FailsafeMonitor, FailsafeReport, FAILSAFE_LOCK};
