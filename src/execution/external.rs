//! External processing service capability.
//!
//! The orchestrator never processes records itself. It submits each plugin
//! to a processing service, polls the returned task, and cancels it on
//! request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::OrchestratorError;
use crate::workflow::model::{
    DataOutputRef, ExecutionId, ExecutionProgress, PluginMetadata, PluginType,
};

/// Errors reported by the processing service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    /// Unreachable or timed out; worth retrying later
    #[error("processing service unavailable: {0}")]
    Unavailable(String),

    /// The request itself was refused; retrying will not help
    #[error("processing service rejected the request: {0}")]
    Rejected(String),
}

impl ProcessingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<ProcessingError> for OrchestratorError {
    fn from(err: ProcessingError) -> Self {
        OrchestratorError::ExternalService(err.to_string())
    }
}

/// Record input handed to the service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum TaskInput {
    HarvestSource { url: String },
    Records(DataOutputRef),
    Nothing,
}

/// One unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub execution_id: ExecutionId,
    pub dataset_id: String,
    pub plugin_type: PluginType,
    pub metadata: PluginMetadata,
    pub input: TaskInput,
}

/// Lifecycle of a submitted task as seen by the service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Finished,
    Failed(String),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Snapshot returned by a status poll.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub progress: ExecutionProgress,
    /// Location of the produced records once finished
    pub output_location: Option<String>,
}

#[async_trait]
pub trait ProcessingService: Send + Sync {
    /// Starts a task and returns its handle.
    async fn submit(&self, request: &TaskRequest) -> Result<String, ProcessingError>;

    async fn poll_status(&self, task_id: &str) -> Result<TaskStatus, ProcessingError>;

    /// Best-effort cancellation.
    async fn cancel(&self, task_id: &str) -> Result<(), ProcessingError>;
}
