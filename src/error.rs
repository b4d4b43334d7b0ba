//! Orchestrator Error Types
//!
//! One crate-wide error enum covering the three families the orchestrator
//! distinguishes: validation errors reported synchronously to the caller,
//! lookup/conflict errors from the control surface, and transient
//! infrastructure errors that the periodic loops absorb and retry.

use uuid::Uuid;

use crate::workflow::model::PluginType;

/// The result type used throughout the orchestrator.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The requested pipeline violates the ordering rules.
    #[error("pipeline not allowed ({reason}); offending plugin types: {}", format_types(.offending))]
    PipelineValidation {
        /// Plugin types that caused the rejection.
        offending: Vec<PluginType>,
        /// Human readable reason.
        reason: String,
    },

    /// A cardinality limit was exceeded.
    #[error("quota exceeded for dataset {dataset_id}: requested {requested}, limit {limit}")]
    QuotaExceeded {
        dataset_id: String,
        requested: usize,
        limit: usize,
    },

    /// The dataset already has a non-terminal execution.
    #[error("dataset {dataset_id} already has an active execution {execution_id}")]
    ExecutionAlreadyExists {
        dataset_id: String,
        execution_id: Uuid,
    },

    #[error("no workflow found with id {0}")]
    NoWorkflowFound(String),

    #[error("no dataset found with id {0}")]
    NoDatasetFound(String),

    #[error("no active workflow execution found with id {0}")]
    NoExecutionFound(Uuid),

    #[error("a scheduled workflow already exists for dataset {0}")]
    ScheduleAlreadyExists(String),

    #[error("no scheduled workflow found for dataset {0}")]
    NoScheduleFound(String),

    /// Malformed input (empty workflow, invalid harvest URL, ...).
    #[error("bad content: {0}")]
    BadContent(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("lock service error: {0}")]
    Lock(String),

    #[error("external processing service error: {0}")]
    ExternalService(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Shorthand for a pipeline validation failure.
    pub fn pipeline(offending: Vec<PluginType>, reason: impl Into<String>) -> Self {
        Self::PipelineValidation {
            offending,
            reason: reason.into(),
        }
    }

    /// Returns true for infrastructure errors that are retried by the
    /// periodic loops rather than surfaced as execution failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Repository(_) | Self::Queue(_) | Self::Lock(_) | Self::ExternalService(_)
        )
    }

    /// Returns true for errors caused by the caller's request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::PipelineValidation { .. } | Self::QuotaExceeded { .. } | Self::BadContent(_)
        )
    }
}

fn format_types(types: &[PluginType]) -> String {
    if types.is_empty() {
        return "none".to_string();
    }
    types
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
