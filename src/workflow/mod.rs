//! Workflow Definition Module
//!
//! Data structures for pipeline definitions and their executions, the
//! plugin ordering rules, and the builder turning a definition into an
//! execution.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Workflow, WorkflowExecution, ...)
//! - [`rules`]: Per-plugin-type predecessor and post-processing table
//! - [`validator`]: Ordering and cardinality validation
//! - [`builder`]: Pipeline building against a dataset's history
//! - [`parser`]: YAML loading

pub mod builder;
pub mod model;
pub mod parser;
pub mod rules;
pub mod validator;

pub use builder::{PipelineBuilder, PredecessorContext};
pub use model::{
    ExecutionId, ExecutionStatus, PluginExecution, PluginMetadata, PluginType, ScheduledWorkflow,
    Workflow, WorkflowExecution,
};
pub use parser::load_workflow;
pub use validator::{validate_workflow, ValidationLimits};
