//! Metis Orchestrator - Distributed Workflow Execution
//!
//! Runs metadata processing pipelines (harvesting, validation,
//! transformation, enrichment, media processing, indexing, depublication)
//! against datasets, one plugin at a time, on any number of cooperating
//! nodes.
//!
//! # Architecture
//!
//! - [`workflow`]: Definitions, executions, ordering rules and the pipeline builder
//! - [`execution`]: Admission control, the execution manager and the queue consumer
//! - [`queue`]: Priority dispatch channel
//! - [`persistence`]: Repositories with conditional writes
//! - [`lock`]: Lease-based distributed lock
//! - [`monitoring`]: Failsafe recovery of stuck executions
//! - [`scheduling`]: Periodic triggering of stored workflows
//! - [`orchestrator`]: Control surface (start, cancel, schedules)
//! - [`runtime`]: Node assembly and its loops
//!
//! # Example
//!
//! ```rust,no_run
//! use metis_orchestrator::config::OrchestratorConfig;
//! use metis_orchestrator::runtime::{Collaborators, Node};
//! use metis_orchestrator::load_workflow;
//! use metis_orchestrator::workflow::model::Dataset;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = load_workflow("ingest.yaml")?;
//!
//!     let node = Node::new(OrchestratorConfig::default(), Collaborators::in_memory());
//!     node.orchestrator().register_dataset(Dataset::new("1", "Maps")).await?;
//!     let running = node.start().await?;
//!
//!     let execution = running.orchestrator().start_workflow("1", &workflow, 0, None).await?;
//!     println!("Queued {}", execution.id);
//!     running.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod lock;
pub mod monitoring;
pub mod orchestrator;
pub mod persistence;
pub mod queue;
pub mod runtime;
pub mod scheduling;
pub mod workflow;

// Re-export commonly used types
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
pub use workflow::model::{Workflow, WorkflowExecution};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Metis Orchestrator";
