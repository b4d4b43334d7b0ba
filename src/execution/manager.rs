//! Execution Manager
//!
//! Advances a [`WorkflowExecution`] one plugin at a time:
//!
//! 1. On dequeue, load the execution and discard it if it is terminal
//! 2. Turn a pending cancellation request into `CANCELLED`
//! 3. Acquire an admission permit for the current plugin, or requeue
//! 4. Claim the execution with a conditional write
//! 5. Submit the plugin (or resume a task already submitted) and poll it,
//!    refreshing the heartbeat on every poll
//! 6. Release the permit, post-process, then hand the execution back to the
//!    queue for its next plugin or finalize it
//!
//! Every write made while a plugin runs is conditional. Losing one to a
//! foreign writer means another node took over, and the local run stops
//! without touching the execution again.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};

use super::admission::{AdmissionController, AdmissionPermit};
use super::external::{ProcessingError, ProcessingService, TaskInput, TaskRequest, TaskState};
use super::postprocess::PostProcessor;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::persistence::{ExecutionRepository, Repository};
use crate::queue::DispatchQueue;
use crate::workflow::model::{
    DataOutputRef, ExecutionId, ExecutionStatus, PluginInput, WorkflowExecution,
};

/// Consecutive transient poll failures tolerated before a plugin fails.
const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 3;

/// Attempts at a conditional write before giving up on a dequeue.
const WRITE_ATTEMPTS: usize = 3;

/// What happened to a dequeued execution id.
#[derive(Debug)]
pub enum DequeueOutcome {
    /// Unknown or already terminal; nothing to do
    Discarded,
    /// A pending cancellation was applied
    Cancelled,
    /// No permit within the timeout; published again
    Requeued,
    /// Another node, or a run on this node, is actively running it
    Skipped,
    /// Claimed and holding a permit, ready to run
    Ready(PreparedRun),
}

/// A claimed execution with the permit for its current plugin.
#[derive(Debug)]
pub struct PreparedRun {
    pub execution: WorkflowExecution,
    pub plugin_index: usize,
    permit: AdmissionPermit,
    local: LocalRun,
}

type RunningSet = Arc<Mutex<HashSet<ExecutionId>>>;

/// Marks an execution as being run by this node until dropped.
#[derive(Debug)]
struct LocalRun {
    execution_id: ExecutionId,
    running: RunningSet,
}

impl LocalRun {
    fn start(running: &RunningSet, execution_id: ExecutionId) -> Self {
        lock_running(running).insert(execution_id);
        Self {
            execution_id,
            running: running.clone(),
        }
    }
}

impl Drop for LocalRun {
    fn drop(&mut self) {
        lock_running(&self.running).remove(&self.execution_id);
    }
}

fn lock_running(running: &RunningSet) -> MutexGuard<'_, HashSet<ExecutionId>> {
    // The set stays consistent even if a holder panicked
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum PluginOutcome {
    Finished,
    Failed,
    Cancelled,
    /// Handed back to the queue before it started
    Requeued,
    /// Another node owns the execution now
    Abandoned,
}

pub struct ExecutionManager {
    config: Arc<OrchestratorConfig>,
    repository: Arc<dyn Repository>,
    queue: DispatchQueue,
    admission: AdmissionController,
    processing: Arc<dyn ProcessingService>,
    post_processor: PostProcessor,
    running: RunningSet,
}

impl ExecutionManager {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        repository: Arc<dyn Repository>,
        queue: DispatchQueue,
        admission: AdmissionController,
        processing: Arc<dyn ProcessingService>,
    ) -> Self {
        let post_processor = PostProcessor::new(repository.clone());
        Self {
            config,
            repository,
            queue,
            admission,
            processing,
            post_processor,
            running: RunningSet::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Handles a dequeued execution id up to the point where its plugin
    /// can start.
    pub async fn prepare(&self, execution_id: ExecutionId) -> Result<DequeueOutcome> {
        let mut held: Option<AdmissionPermit> = None;

        for _ in 0..WRITE_ATTEMPTS {
            let Some(mut execution) = self.repository.get_execution(execution_id).await? else {
                warn!("Dequeued unknown execution {}", execution_id);
                return Ok(DequeueOutcome::Discarded);
            };
            if execution.is_terminal() {
                debug!(
                    "Execution {} already {}, discarding duplicate dispatch",
                    execution_id, execution.status
                );
                return Ok(DequeueOutcome::Discarded);
            }

            if execution.cancelling {
                self.cancel_running_task(&execution).await;
                execution.cancel_all(Utc::now());
                if self.repository.update_if_revision(&execution).await?.is_some() {
                    info!(
                        "Cancelled execution {} of dataset {}",
                        execution.id, execution.dataset_id
                    );
                    return Ok(DequeueOutcome::Cancelled);
                }
                continue;
            }

            let Some(index) = execution.current_plugin_index() else {
                close(&mut execution);
                if self.repository.update_if_revision(&execution).await?.is_some() {
                    return Ok(DequeueOutcome::Discarded);
                }
                continue;
            };

            if lock_running(&self.running).contains(&execution.id) {
                debug!(
                    "Execution {} is already running on this node, skipping",
                    execution.id
                );
                return Ok(DequeueOutcome::Skipped);
            }

            if !self.is_claimable(&execution) {
                debug!(
                    "Execution {} is running on {:?}, skipping",
                    execution.id, execution.owner
                );
                return Ok(DequeueOutcome::Skipped);
            }

            let plugin_type = execution.plugins[index].plugin_type;
            let permit = match held.take() {
                Some(permit) if permit.plugin_type() == plugin_type => permit,
                _ => match self
                    .admission
                    .try_acquire(plugin_type, self.config.admission_timeout())
                    .await
                {
                    Some(permit) => permit,
                    None => {
                        info!(
                            "No {} permit available, requeueing execution {} of dataset {}",
                            plugin_type, execution.id, execution.dataset_id
                        );
                        self.queue.publish(execution.id, execution.priority).await?;
                        return Ok(DequeueOutcome::Requeued);
                    }
                },
            };

            let now = Utc::now();
            execution.owner = Some(self.config.node_id.clone());
            execution.status = ExecutionStatus::Running;
            execution.started_date.get_or_insert(now);
            execution.updated_date = Some(now);
            // A resumed plugin keeps its heartbeat fresh from the claim on
            let plugin = &mut execution.plugins[index];
            if plugin.status == ExecutionStatus::Running {
                plugin.updated_date = Some(now);
            }

            match self.repository.update_if_revision(&execution).await? {
                Some(stored) => {
                    return Ok(DequeueOutcome::Ready(PreparedRun {
                        local: LocalRun::start(&self.running, stored.id),
                        execution: stored,
                        plugin_index: index,
                        permit,
                    }))
                }
                None => {
                    debug!("Lost claim on execution {}, reloading", execution_id);
                    held = Some(permit);
                }
            }
        }

        Ok(DequeueOutcome::Skipped)
    }

    /// Runs the claimed plugin to completion and moves the execution on.
    pub async fn run(&self, prepared: PreparedRun) -> Result<()> {
        let PreparedRun {
            mut execution,
            plugin_index,
            permit,
            local: _local,
        } = prepared;

        let outcome = self.drive_plugin(&mut execution, plugin_index).await;
        self.admission.release(permit);

        match outcome? {
            PluginOutcome::Requeued | PluginOutcome::Abandoned => Ok(()),
            PluginOutcome::Cancelled => {
                execution.cancel_all(Utc::now());
                if self.persist_owned(&mut execution).await? {
                    info!(
                        "Cancelled execution {} of dataset {}",
                        execution.id, execution.dataset_id
                    );
                }
                Ok(())
            }
            PluginOutcome::Finished => {
                let applied = self
                    .post_processor
                    .apply(&mut execution, plugin_index)
                    .await;
                if let Err(e) = applied {
                    let plugin = &mut execution.plugins[plugin_index];
                    warn!(
                        "Post-processing of {} failed for execution {}: {}",
                        plugin.plugin_type, execution.id, e
                    );
                    plugin.fail(format!("post-processing failed: {}", e), Utc::now());
                }
                self.advance(&mut execution).await
            }
            PluginOutcome::Failed => {
                let plugin = &execution.plugins[plugin_index];
                warn!(
                    "{} failed for execution {} of dataset {}: {}",
                    plugin.plugin_type,
                    execution.id,
                    execution.dataset_id,
                    plugin.fail_message.as_deref().unwrap_or("unknown error")
                );
                self.advance(&mut execution).await
            }
        }
    }

    async fn drive_plugin(
        &self,
        execution: &mut WorkflowExecution,
        index: usize,
    ) -> Result<PluginOutcome> {
        let plugin = &execution.plugins[index];
        if plugin.status == ExecutionStatus::Running && plugin.external_task_id.is_some() {
            info!(
                "Resuming monitoring of {} for execution {}",
                plugin.plugin_type, execution.id
            );
        } else if let Some(outcome) = self.submit_plugin(execution, index).await? {
            return Ok(outcome);
        }
        self.monitor_plugin(execution, index).await
    }

    /// Submits the plugin. Returns `None` once it is running and recorded.
    async fn submit_plugin(
        &self,
        execution: &mut WorkflowExecution,
        index: usize,
    ) -> Result<Option<PluginOutcome>> {
        let now = Utc::now();
        let input = match resolve_input(execution, index) {
            Ok(input) => input,
            Err(message) => {
                execution.plugins[index].fail(message, now);
                return Ok(Some(PluginOutcome::Failed));
            }
        };

        let plugin = &execution.plugins[index];
        let request = TaskRequest {
            execution_id: execution.id,
            dataset_id: execution.dataset_id.clone(),
            plugin_type: plugin.plugin_type,
            metadata: plugin.metadata.clone(),
            input,
        };

        let task_id = match self.call_external(self.processing.submit(&request)).await {
            Ok(task_id) => task_id,
            Err(ProcessingError::Unavailable(reason)) => {
                warn!(
                    "Processing service unavailable for execution {}: {}; requeueing",
                    execution.id, reason
                );
                self.hand_back(execution).await?;
                return Ok(Some(PluginOutcome::Requeued));
            }
            Err(ProcessingError::Rejected(reason)) => {
                execution.plugins[index].fail(format!("submission rejected: {}", reason), now);
                return Ok(Some(PluginOutcome::Failed));
            }
        };

        let plugin = &mut execution.plugins[index];
        plugin.status = ExecutionStatus::Running;
        plugin.external_task_id = Some(task_id.clone());
        plugin.started_date = Some(now);
        plugin.updated_date = Some(now);
        execution.updated_date = Some(now);

        if !self.persist_owned(execution).await? {
            warn!(
                "Execution {} was taken over before task {} was recorded",
                execution.id, task_id
            );
            self.cancel_task(&task_id).await;
            return Ok(Some(PluginOutcome::Abandoned));
        }

        info!(
            "Started {} for execution {} of dataset {} (task {})",
            request.plugin_type, execution.id, execution.dataset_id, task_id
        );
        Ok(None)
    }

    async fn monitor_plugin(
        &self,
        execution: &mut WorkflowExecution,
        index: usize,
    ) -> Result<PluginOutcome> {
        let task_id = execution.plugins[index]
            .external_task_id
            .clone()
            .unwrap_or_default();
        let mut consecutive_failures = 0u32;
        let mut last_processed = execution.plugins[index].progress.processed_records;
        let mut last_change = Instant::now();

        loop {
            if execution.cancelling {
                self.cancel_task(&task_id).await;
                return Ok(PluginOutcome::Cancelled);
            }

            tokio::time::sleep(self.config.monitor_interval()).await;
            let now = Utc::now();

            match self.call_external(self.processing.poll_status(&task_id)).await {
                Ok(status) => {
                    consecutive_failures = 0;
                    let execution_id = execution.id;
                    let plugin = &mut execution.plugins[index];
                    plugin.progress = status.progress;

                    match status.state {
                        TaskState::Finished => {
                            plugin.status = ExecutionStatus::Finished;
                            plugin.updated_date = Some(now);
                            plugin.finished_date = Some(now);
                            plugin.data_output = Some(DataOutputRef {
                                execution_id,
                                plugin_type: plugin.plugin_type,
                                finished_date: now,
                                location: status.output_location.unwrap_or_default(),
                            });
                            info!(
                                "{} finished for execution {} ({} records processed)",
                                plugin.plugin_type, execution_id, plugin.progress.processed_records
                            );
                            return Ok(PluginOutcome::Finished);
                        }
                        TaskState::Failed(message) => {
                            plugin.fail(message, now);
                            return Ok(PluginOutcome::Failed);
                        }
                        TaskState::Cancelled => {
                            plugin.fail("task cancelled by the processing service", now);
                            return Ok(PluginOutcome::Failed);
                        }
                        TaskState::Running => {
                            if status.progress.processed_records != last_processed {
                                last_processed = status.progress.processed_records;
                                last_change = Instant::now();
                            } else if let Some(limit) = self.config.no_progress_limit() {
                                if last_change.elapsed() >= limit {
                                    warn!(
                                        "{} of execution {} made no progress for {:?}, cancelling",
                                        plugin.plugin_type, execution_id, limit
                                    );
                                    plugin.cancel(
                                        Some(format!("no progress for {:?}", limit)),
                                        now,
                                    );
                                    self.cancel_task(&task_id).await;
                                    return Ok(PluginOutcome::Cancelled);
                                }
                            }
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    consecutive_failures += 1;
                    warn!(
                        "Polling task {} of execution {} failed ({} in a row): {}",
                        task_id, execution.id, consecutive_failures, e
                    );
                    if consecutive_failures > MAX_CONSECUTIVE_POLL_FAILURES {
                        execution.plugins[index].fail(
                            format!(
                                "monitoring failed {} times in a row: {}",
                                consecutive_failures, e
                            ),
                            now,
                        );
                        return Ok(PluginOutcome::Failed);
                    }
                }
                Err(e) => {
                    execution.plugins[index].fail(format!("monitoring failed: {}", e), now);
                    return Ok(PluginOutcome::Failed);
                }
            }

            execution.plugins[index].updated_date = Some(now);
            execution.updated_date = Some(now);
            if !self.persist_owned(execution).await? {
                warn!(
                    "Execution {} was taken over by another node, abandoning task {}",
                    execution.id, task_id
                );
                return Ok(PluginOutcome::Abandoned);
            }
        }
    }

    /// Skips plugins that may no longer run, then either hands the
    /// execution back to the queue for its next plugin or finalizes it.
    async fn advance(&self, execution: &mut WorkflowExecution) -> Result<()> {
        let now = Utc::now();
        execution.recovery_attempts = 0;

        let mut next = None;
        for index in 0..execution.plugins.len() {
            if execution.plugins[index].status != ExecutionStatus::Queued {
                continue;
            }
            if may_run(execution, index) {
                next = Some(index);
                break;
            }
            let plugin = &mut execution.plugins[index];
            info!(
                "Skipping {} of execution {}: a required predecessor did not finish",
                plugin.plugin_type, execution.id
            );
            plugin.cancel(
                Some("skipped: a required predecessor did not finish".to_string()),
                now,
            );
        }

        match next {
            Some(index) => {
                debug!(
                    "Execution {} continues with {}",
                    execution.id, execution.plugins[index].plugin_type
                );
                self.hand_back(execution).await
            }
            None => {
                close(execution);
                if self.persist_owned(execution).await? {
                    info!(
                        "Execution {} of dataset {} ended {}",
                        execution.id, execution.dataset_id, execution.status
                    );
                }
                Ok(())
            }
        }
    }

    /// Releases ownership and publishes the execution again.
    async fn hand_back(&self, execution: &mut WorkflowExecution) -> Result<()> {
        execution.owner = None;
        execution.updated_date = Some(Utc::now());
        if self.persist_owned(execution).await? {
            self.queue.publish(execution.id, execution.priority).await?;
        }
        Ok(())
    }

    /// Conditional write on an execution this node owns. A lost race is
    /// retried only when the stored copy is still ours; the other writers
    /// (cancel requests, failsafe bookkeeping) never change ownership.
    async fn persist_owned(&self, execution: &mut WorkflowExecution) -> Result<bool> {
        for _ in 0..WRITE_ATTEMPTS {
            if let Some(stored) = self.repository.update_if_revision(execution).await? {
                *execution = stored;
                return Ok(true);
            }
            let Some(current) = self.repository.get_execution(execution.id).await? else {
                return Ok(false);
            };
            if current.is_terminal() || current.owner.as_deref() != Some(self.node_id()) {
                return Ok(false);
            }
            execution.revision = current.revision;
            execution.cancelling |= current.cancelling;
        }
        Ok(false)
    }

    fn is_claimable(&self, execution: &WorkflowExecution) -> bool {
        match (execution.status, &execution.owner) {
            (ExecutionStatus::Queued, _) => true,
            (ExecutionStatus::Running, None) => true,
            (ExecutionStatus::Running, Some(_)) => {
                let leniency = self.config.failsafe_leniency();
                execution.heartbeat().map_or(true, |beat| {
                    (Utc::now() - beat)
                        .to_std()
                        .map_or(false, |silence| silence > leniency)
                })
            }
            _ => false,
        }
    }

    async fn call_external<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, ProcessingError>>,
    ) -> std::result::Result<T, ProcessingError> {
        let limit = Duration::from_millis(
            self.config.external_connect_timeout_millis + self.config.external_read_timeout_millis,
        );
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::Unavailable(format!(
                "no answer within {:?}",
                limit
            ))),
        }
    }

    async fn cancel_running_task(&self, execution: &WorkflowExecution) {
        if let Some(task_id) = execution
            .running_plugin()
            .and_then(|p| p.external_task_id.as_deref())
        {
            self.cancel_task(task_id).await;
        }
    }

    /// Best-effort cancellation of an external task.
    async fn cancel_task(&self, task_id: &str) {
        if let Err(e) = self.call_external(self.processing.cancel(task_id)).await {
            warn!("Failed to cancel task {}: {}", task_id, e);
        }
    }
}

/// Whether the plugin at `index` may start given the state of the plugins
/// before it.
///
/// Finished plugins and failed non-blocking plugins let it through. Any
/// other failure or skip only lets predecessor-tolerant plugins run.
pub fn may_run(execution: &WorkflowExecution, index: usize) -> bool {
    let mut blocked = false;
    for earlier in &execution.plugins[..index] {
        match earlier.status {
            ExecutionStatus::Finished => {}
            ExecutionStatus::Failed if earlier.plugin_type.rule().non_blocking => {}
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => blocked = true,
            ExecutionStatus::Queued | ExecutionStatus::Running => return false,
        }
    }

    let plugin = &execution.plugins[index];
    if blocked && !plugin.plugin_type.rule().tolerant_of_failed_predecessor {
        return false;
    }
    match &plugin.input {
        PluginInput::Predecessor { plugin_type } => {
            execution.latest_finished_of(&[*plugin_type]).is_some()
        }
        _ => true,
    }
}

/// Sets the final status once no plugin is left to run.
fn close(execution: &mut WorkflowExecution) {
    let now = Utc::now();
    let blocking_failure = execution.plugins.iter().any(|p| {
        p.status == ExecutionStatus::Failed && !p.plugin_type.rule().non_blocking
    });
    execution.status = if blocking_failure {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Finished
    };
    execution.owner = None;
    execution.updated_date = Some(now);
    execution.finished_date = Some(now);
}

fn resolve_input(
    execution: &WorkflowExecution,
    index: usize,
) -> std::result::Result<TaskInput, String> {
    match &execution.plugins[index].input {
        PluginInput::HarvestSource { url } => Ok(TaskInput::HarvestSource { url: url.clone() }),
        PluginInput::History { output } => Ok(TaskInput::Records(output.clone())),
        PluginInput::Predecessor { plugin_type } => execution
            .latest_finished_of(&[*plugin_type])
            .and_then(|p| p.data_output.clone())
            .map(TaskInput::Records)
            .ok_or_else(|| format!("output of {} is not available", plugin_type)),
        PluginInput::Nothing => Ok(TaskInput::Nothing),
    }
}
