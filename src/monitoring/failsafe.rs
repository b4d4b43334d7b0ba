//! Failsafe Monitor
//!
//! Recovers executions whose owner went silent. Runs on every node, but a
//! tick only does work on the node holding the cluster-wide `failsafe`
//! lock.
//!
//! An execution is stuck when it is `RUNNING` and its latest heartbeat is
//! older than the configured leniency. A stuck execution is published again
//! (any node may then take it over) until it has used up its recovery
//! attempts, after which its running plugin and the execution are failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::execution::ProcessingService;
use crate::lock::{LockGuard, LockService};
use crate::persistence::{ExecutionRepository, Repository};
use crate::queue::DispatchQueue;
use crate::workflow::model::{ExecutionStatus, WorkflowExecution};

/// Name of the lock serializing failsafe ticks across nodes.
pub const FAILSAFE_LOCK: &str = "failsafe";

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FailsafeReport {
    pub republished: usize,
    pub failed: usize,
}

pub struct FailsafeMonitor {
    config: Arc<OrchestratorConfig>,
    repository: Arc<dyn Repository>,
    queue: DispatchQueue,
    locks: Arc<dyn LockService>,
    processing: Arc<dyn ProcessingService>,
}

impl FailsafeMonitor {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        repository: Arc<dyn Repository>,
        queue: DispatchQueue,
        locks: Arc<dyn LockService>,
        processing: Arc<dyn ProcessingService>,
    ) -> Self {
        Self {
            config,
            repository,
            queue,
            locks,
            processing,
        }
    }

    /// Ticks every `failsafe_check_interval_millis` until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Failsafe monitor started (leniency {:?})",
            self.config.failsafe_leniency()
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.failsafe_interval()) => {
                    if let Err(e) = self.tick().await {
                        warn!("Failsafe check failed: {}", e);
                    }
                }
            }
        }
        info!("Failsafe monitor stopped");
    }

    /// One check under the failsafe lock. Returns `None` when another node
    /// holds the lock.
    pub async fn tick(&self) -> Result<Option<FailsafeReport>> {
        let Some(guard) = LockGuard::try_acquire(
            self.locks.clone(),
            FAILSAFE_LOCK,
            &self.config.node_id,
            self.config.lock_lease(),
        )
        .await?
        else {
            debug!("Failsafe lock held elsewhere, skipping tick");
            return Ok(None);
        };

        let result = self.recover_stuck(&guard, Utc::now()).await;
        if let Err(e) = guard.release().await {
            warn!("Failed to release {} lock: {}", FAILSAFE_LOCK, e);
        }
        result.map(Some)
    }

    async fn recover_stuck(&self, guard: &LockGuard, now: DateTime<Utc>) -> Result<FailsafeReport> {
        let mut report = FailsafeReport::default();
        let running = self
            .repository
            .list_with_status(ExecutionStatus::Running)
            .await?;

        for execution in running {
            if guard.is_lost() {
                warn!("Lost the {} lock, ending tick early", FAILSAFE_LOCK);
                break;
            }
            if !self.is_stuck(&execution, now) {
                continue;
            }
            match self.recover(execution, now).await {
                Ok(Recovery::Republished) => report.republished += 1,
                Ok(Recovery::Failed) => report.failed += 1,
                Ok(Recovery::Raced) => {}
                Err(e) => warn!("Failsafe could not recover an execution: {}", e),
            }
        }

        if report != FailsafeReport::default() {
            info!(
                "Failsafe republished {} and failed {} stuck execution(s)",
                report.republished, report.failed
            );
        }
        Ok(report)
    }

    fn is_stuck(&self, execution: &WorkflowExecution, now: DateTime<Utc>) -> bool {
        let leniency = self.config.failsafe_leniency();
        match execution.heartbeat() {
            Some(beat) => (now - beat)
                .to_std()
                .map_or(false, |silence| silence > leniency),
            None => true,
        }
    }

    async fn recover(&self, mut execution: WorkflowExecution, now: DateTime<Utc>) -> Result<Recovery> {
        if execution.recovery_attempts < self.config.max_recovery_attempts {
            execution.recovery_attempts += 1;
            let attempt = execution.recovery_attempts;
            if self.repository.update_if_revision(&execution).await?.is_none() {
                return Ok(Recovery::Raced);
            }
            warn!(
                "Execution {} of dataset {} is stuck (owner {:?}), republishing (attempt {}/{})",
                execution.id,
                execution.dataset_id,
                execution.owner,
                attempt,
                self.config.max_recovery_attempts
            );
            self.queue.publish(execution.id, execution.priority).await?;
            return Ok(Recovery::Republished);
        }

        let message = format!(
            "stuck: no heartbeat after {} recovery attempts",
            execution.recovery_attempts
        );
        let task_id = execution
            .running_plugin()
            .and_then(|p| p.external_task_id.clone());
        if let Some(index) = execution.current_plugin_index() {
            execution.plugins[index].fail(message.clone(), now);
        }
        for plugin in &mut execution.plugins {
            if plugin.status == ExecutionStatus::Queued {
                plugin.cancel(Some("skipped: execution failed".to_string()), now);
            }
        }
        execution.status = ExecutionStatus::Failed;
        execution.owner = None;
        execution.updated_date = Some(now);
        execution.finished_date = Some(now);

        if self.repository.update_if_revision(&execution).await?.is_none() {
            return Ok(Recovery::Raced);
        }
        warn!(
            "Execution {} of dataset {} failed by failsafe: {}",
            execution.id, execution.dataset_id, message
        );
        if let Some(task_id) = task_id {
            self.cancel_task(&task_id).await;
        }
        Ok(Recovery::Failed)
    }

    /// Best-effort cancellation of the external task of a failed plugin.
    async fn cancel_task(&self, task_id: &str) {
        let limit = Duration::from_millis(
            self.config.external_connect_timeout_millis + self.config.external_read_timeout_millis,
        );
        match tokio::time::timeout(limit, self.processing.cancel(task_id)).await {
            Ok(Ok(())) => debug!("Cancelled task {}", task_id),
            Ok(Err(e)) => warn!("Failed to cancel task {}: {}", task_id, e),
            Err(_) => warn!("Cancelling task {} timed out after {:?}", task_id, limit),
        }
    }
}

enum Recovery {
    Republished,
    Failed,
    Raced,
}
