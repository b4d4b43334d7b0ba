//! Orchestrator Control Surface
//!
//! The operations exposed to an inbound layer: starting a workflow on a
//! dataset, cancelling an execution and managing scheduled workflows.
//! Each one is a thin call into the pipeline builder, the repository and
//! the dispatch queue.

use std::sync::Arc;

use log::info;

use crate::error::{OrchestratorError, Result};
use crate::persistence::{
    CreateOutcome, DatasetRepository, ExecutionRepository, Repository, ScheduleRepository,
};
use crate::queue::DispatchQueue;
use crate::workflow::builder::{PipelineBuilder, PredecessorContext};
use crate::workflow::model::{
    Dataset, ExecutionId, PluginType, ScheduledWorkflow, Workflow, WorkflowExecution,
};
use crate::workflow::validator::ValidationLimits;

#[derive(Clone)]
pub struct Orchestrator {
    repository: Arc<dyn Repository>,
    queue: DispatchQueue,
    builder: PipelineBuilder,
}

impl Orchestrator {
    pub fn new(repository: Arc<dyn Repository>, queue: DispatchQueue, limits: ValidationLimits) -> Self {
        Self {
            repository,
            queue,
            builder: PipelineBuilder::new(limits),
        }
    }

    /// Builds, persists and dispatches a new execution.
    ///
    /// # Arguments
    ///
    /// * `dataset_id` - Target dataset, which must exist
    /// * `workflow` - Pipeline definition to run
    /// * `priority` - Dispatch priority, clamped by the queue
    /// * `enforced_predecessor` - Fixed input type for the first plugin
    ///
    /// # Errors
    ///
    /// Validation errors leave no trace. A dataset with a non-terminal
    /// execution yields [`OrchestratorError::ExecutionAlreadyExists`].
    pub async fn start_workflow(
        &self,
        dataset_id: &str,
        workflow: &Workflow,
        priority: u8,
        enforced_predecessor: Option<PluginType>,
    ) -> Result<WorkflowExecution> {
        self.dataset(dataset_id).await?;

        let context = PredecessorContext::load(self.repository.as_ref(), dataset_id).await?;
        let execution = self
            .builder
            .build(workflow, &context, priority, enforced_predecessor)?;

        let execution = match self.repository.create_if_none_active(execution).await? {
            CreateOutcome::Created(execution) => execution,
            CreateOutcome::AlreadyActive(execution_id) => {
                return Err(OrchestratorError::ExecutionAlreadyExists {
                    dataset_id: dataset_id.to_string(),
                    execution_id,
                })
            }
        };

        // The execution is stored; if this publish is lost, startup recovery
        // republishes queued executions
        self.queue.publish(execution.id, execution.priority).await?;
        info!(
            "Queued execution {} of workflow {} for dataset {} (priority {})",
            execution.id, execution.workflow_id, dataset_id, execution.priority
        );
        Ok(execution)
    }

    /// Starts the stored workflow with the given id.
    pub async fn start_stored_workflow(
        &self,
        dataset_id: &str,
        workflow_id: &str,
        priority: u8,
        enforced_predecessor: Option<PluginType>,
    ) -> Result<WorkflowExecution> {
        let workflow = self.workflow(workflow_id).await?;
        self.start_workflow(dataset_id, &workflow, priority, enforced_predecessor)
            .await
    }

    /// Requests cancellation. The execution turns `CANCELLED` the next time
    /// its manager observes it.
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<WorkflowExecution> {
        let execution = self
            .repository
            .request_cancel(execution_id)
            .await?
            .ok_or(OrchestratorError::NoExecutionFound(execution_id))?;

        info!(
            "Cancellation requested for execution {} of dataset {}",
            execution_id, execution.dataset_id
        );
        // A queued execution has no poll loop to notice the flag
        self.queue.publish(execution.id, execution.priority).await?;
        Ok(execution)
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<WorkflowExecution> {
        self.repository
            .get_execution(execution_id)
            .await?
            .ok_or(OrchestratorError::NoExecutionFound(execution_id))
    }

    pub async fn active_execution(&self, dataset_id: &str) -> Result<Option<WorkflowExecution>> {
        self.repository.active_for_dataset(dataset_id).await
    }

    pub async fn register_dataset(&self, dataset: Dataset) -> Result<()> {
        self.repository.save_dataset(dataset).await
    }

    pub async fn save_workflow(&self, workflow: Workflow) -> Result<()> {
        if workflow.is_empty() {
            return Err(OrchestratorError::BadContent(format!(
                "workflow {} has no plugins",
                workflow.workflow_id
            )));
        }
        self.repository.save_workflow(workflow).await
    }

    pub async fn dataset(&self, dataset_id: &str) -> Result<Dataset> {
        self.repository
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| OrchestratorError::NoDatasetFound(dataset_id.to_string()))
    }

    /// Creates the schedule of a dataset. A dataset has at most one.
    pub async fn schedule_workflow(&self, schedule: ScheduledWorkflow) -> Result<ScheduledWorkflow> {
        self.check_schedule_targets(&schedule).await?;
        if !self.repository.insert_schedule(schedule.clone()).await? {
            return Err(OrchestratorError::ScheduleAlreadyExists(
                schedule.dataset_id,
            ));
        }
        info!(
            "Scheduled workflow {} for dataset {} ({:?} from {})",
            schedule.workflow_id, schedule.dataset_id, schedule.frequency, schedule.pointer_date
        );
        Ok(schedule)
    }

    pub async fn update_schedule(&self, schedule: ScheduledWorkflow) -> Result<ScheduledWorkflow> {
        self.check_schedule_targets(&schedule).await?;
        if !self.repository.replace_schedule(schedule.clone()).await? {
            return Err(OrchestratorError::NoScheduleFound(schedule.dataset_id));
        }
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, dataset_id: &str) -> Result<()> {
        if !self.repository.delete_schedule(dataset_id).await? {
            return Err(OrchestratorError::NoScheduleFound(dataset_id.to_string()));
        }
        info!("Deleted schedule of dataset {}", dataset_id);
        Ok(())
    }

    pub async fn get_schedule(&self, dataset_id: &str) -> Result<ScheduledWorkflow> {
        self.repository
            .get_schedule(dataset_id)
            .await?
            .ok_or_else(|| OrchestratorError::NoScheduleFound(dataset_id.to_string()))
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduledWorkflow>> {
        self.repository.list_schedules().await
    }

    async fn check_schedule_targets(&self, schedule: &ScheduledWorkflow) -> Result<()> {
        self.dataset(&schedule.dataset_id).await?;
        self.workflow(&schedule.workflow_id).await?;
        Ok(())
    }

    async fn workflow(&self, workflow_id: &str) -> Result<Workflow> {
        self.repository
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::NoWorkflowFound(workflow_id.to_string()))
    }
}
