//! Workflow Execution Module
//!
//! Runs executions plugin by plugin against an external processing
//! service, bounded by per-type admission permits.
//!
//! # Architecture
//!
//! - [`admission`]: per-plugin-type permit pools
//! - [`external`]: the processing service capability
//! - [`simulated`]: in-process processing service
//! - [`postprocess`]: dataset side effects of finished plugins
//! - [`manager`]: the per-execution state machine
//! - [`consumer`]: the serialized consume-dispatch loop

pub mod admission;
pub mod consumer;
pub mod external;
pub mod manager;
pub mod postprocess;
pub mod simulated;

pub use admission::{AdmissionController, AdmissionPermit};
pub use consumer::Consumer;
pub use external::{ProcessingError, ProcessingService, TaskInput, TaskRequest, TaskState, TaskStatus};
pub use manager::{DequeueOutcome, ExecutionManager, PreparedRun};
pub use postprocess::PostProcessor;
pub use simulated::SimulatedProcessingService;
