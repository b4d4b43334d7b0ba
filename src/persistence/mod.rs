//! Persistence Module
//!
//! Repository interfaces for executions, datasets, workflow definitions
//! and schedules.
//!
//! # Structure
//!
//! - [`ExecutionRepository`]: executions with atomic conditional writes
//! - [`DatasetRepository`]: dataset publication metadata and stored workflows
//! - [`ScheduleRepository`]: scheduled workflow CRUD
//! - [`memory`]: in-process implementation of all three
//!
//! Record-level consistency relies on the conditional writes offered
//! here. Every update of a [`WorkflowExecution`] is checked against the
//! revision the writer last read. The `cancelling` flag and plugin
//! `data_deleted` marks are never cleared by an update.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::workflow::model::{
    Dataset, ExecutionId, ExecutionStatus, PluginExecution, PluginType, ScheduledWorkflow,
    Workflow, WorkflowExecution,
};

pub use memory::InMemoryRepository;

/// Outcome of an insert guarded by the one-active-execution rule.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The execution was stored
    Created(WorkflowExecution),
    /// The dataset already has this non-terminal execution
    AlreadyActive(ExecutionId),
}

/// A finished plugin from a dataset's history.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRecord {
    pub execution_id: ExecutionId,
    pub plugin: PluginExecution,
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Inserts the execution unless the dataset already has a
    /// non-terminal one. Check and insert are atomic.
    async fn create_if_none_active(&self, execution: WorkflowExecution) -> Result<CreateOutcome>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>>;

    /// Stores `execution` only if the stored revision still equals
    /// `execution.revision`. Returns the stored copy with its new revision,
    /// or `None` when another writer got there first.
    async fn update_if_revision(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<Option<WorkflowExecution>>;

    /// Raises the sticky cancellation flag of a non-terminal execution.
    /// Returns `None` if the execution is unknown or already terminal.
    async fn request_cancel(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>>;

    async fn list_with_status(&self, status: ExecutionStatus) -> Result<Vec<WorkflowExecution>>;

    /// The non-terminal execution of a dataset, if any.
    async fn active_for_dataset(&self, dataset_id: &str) -> Result<Option<WorkflowExecution>>;

    /// Most recent finished plugin of one of `types` for the dataset whose
    /// output has not been deleted.
    async fn latest_finished_plugin(
        &self,
        dataset_id: &str,
        types: &[PluginType],
    ) -> Result<Option<PluginRecord>>;

    /// Marks the output of a finished plugin as deleted. Bumps the
    /// revision so a writer holding an older copy has to reload.
    async fn mark_plugin_data_deleted(
        &self,
        execution_id: ExecutionId,
        plugin_type: PluginType,
    ) -> Result<()>;
}

#[async_trait]
pub trait DatasetRepository: Send + Sync {
    async fn get_dataset(&self, dataset_id: &str) -> Result<Option<Dataset>>;

    async fn save_dataset(&self, dataset: Dataset) -> Result<()>;

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>>;

    async fn save_workflow(&self, workflow: Workflow) -> Result<()>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn get_schedule(&self, dataset_id: &str) -> Result<Option<ScheduledWorkflow>>;

    /// Inserts a schedule. Returns false if the dataset already has one.
    async fn insert_schedule(&self, schedule: ScheduledWorkflow) -> Result<bool>;

    /// Replaces an existing schedule. Returns false if none exists.
    async fn replace_schedule(&self, schedule: ScheduledWorkflow) -> Result<bool>;

    /// Returns false if no schedule existed.
    async fn delete_schedule(&self, dataset_id: &str) -> Result<bool>;

    /// Schedules whose pointer date is at or before `now`.
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledWorkflow>>;

    async fn list_schedules(&self) -> Result<Vec<ScheduledWorkflow>>;
}

/// Everything the orchestrator needs from storage.
pub trait Repository: ExecutionRepository + DatasetRepository + ScheduleRepository {}

impl<T> Repository for T where T: ExecutionRepository + DatasetRepository + ScheduleRepository {}
