//! In-Memory Repository
//!
//! A single-process store implementing every repository trait. All maps sit
//! behind one mutex so check-and-insert and compare-and-swap operations are
//! atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;

use super::{
    CreateOutcome, DatasetRepository, ExecutionRepository, PluginRecord, ScheduleRepository,
};
use crate::error::{OrchestratorError, Result};
use crate::workflow::model::{
    Dataset, ExecutionId, ExecutionStatus, PluginType, ScheduledWorkflow, Workflow,
    WorkflowExecution,
};

#[derive(Default)]
struct Store {
    executions: HashMap<ExecutionId, WorkflowExecution>,
    datasets: HashMap<String, Dataset>,
    workflows: HashMap<String, Workflow>,
    schedules: HashMap<String, ScheduledWorkflow>,
}

/// Repository backed by in-process hash maps.
#[derive(Default)]
pub struct InMemoryRepository {
    store: Mutex<Store>,
    unavailable: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a repository error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn store(&self) -> Result<MutexGuard<'_, Store>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Repository(
                "repository unavailable".to_string(),
            ));
        }
        self.store
            .lock()
            .map_err(|_| OrchestratorError::Repository("repository lock poisoned".to_string()))
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn create_if_none_active(&self, execution: WorkflowExecution) -> Result<CreateOutcome> {
        let mut store = self.store()?;

        if let Some(active) = store
            .executions
            .values()
            .find(|e| e.dataset_id == execution.dataset_id && !e.is_terminal())
        {
            return Ok(CreateOutcome::AlreadyActive(active.id));
        }

        let mut execution = execution;
        execution.revision = 1;
        store.executions.insert(execution.id, execution.clone());
        debug!(
            "Stored execution {} for dataset {}",
            execution.id, execution.dataset_id
        );
        Ok(CreateOutcome::Created(execution))
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>> {
        Ok(self.store()?.executions.get(&id).cloned())
    }

    async fn update_if_revision(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<Option<WorkflowExecution>> {
        let mut store = self.store()?;
        let Some(stored) = store.executions.get_mut(&execution.id) else {
            return Ok(None);
        };
        if stored.revision != execution.revision {
            return Ok(None);
        }

        let cancelling = stored.cancelling || execution.cancelling;
        let deleted: Vec<bool> = stored.plugins.iter().map(|p| p.data_deleted).collect();
        *stored = execution.clone();
        stored.cancelling = cancelling;
        for (plugin, was_deleted) in stored.plugins.iter_mut().zip(deleted) {
            plugin.data_deleted |= was_deleted;
        }
        stored.revision = execution.revision + 1;
        Ok(Some(stored.clone()))
    }

    async fn request_cancel(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>> {
        let mut store = self.store()?;
        match store.executions.get_mut(&id) {
            Some(stored) if !stored.is_terminal() => {
                stored.cancelling = true;
                stored.revision += 1;
                Ok(Some(stored.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_with_status(&self, status: ExecutionStatus) -> Result<Vec<WorkflowExecution>> {
        let store = self.store()?;
        let mut found: Vec<_> = store
            .executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.created_date);
        Ok(found)
    }

    async fn active_for_dataset(&self, dataset_id: &str) -> Result<Option<WorkflowExecution>> {
        let store = self.store()?;
        Ok(store
            .executions
            .values()
            .find(|e| e.dataset_id == dataset_id && !e.is_terminal())
            .cloned())
    }

    async fn latest_finished_plugin(
        &self,
        dataset_id: &str,
        types: &[PluginType],
    ) -> Result<Option<PluginRecord>> {
        let store = self.store()?;
        let latest = store
            .executions
            .values()
            .filter(|e| e.dataset_id == dataset_id)
            .flat_map(|e| {
                e.plugins.iter().map(move |p| PluginRecord {
                    execution_id: e.id,
                    plugin: p.clone(),
                })
            })
            .filter(|r| {
                r.plugin.status == ExecutionStatus::Finished
                    && !r.plugin.data_deleted
                    && types.contains(&r.plugin.plugin_type)
            })
            .max_by_key(|r| r.plugin.finished_date);
        Ok(latest)
    }

    async fn mark_plugin_data_deleted(
        &self,
        execution_id: ExecutionId,
        plugin_type: PluginType,
    ) -> Result<()> {
        let mut store = self.store()?;
        let execution = store
            .executions
            .get_mut(&execution_id)
            .ok_or(OrchestratorError::NoExecutionFound(execution_id))?;
        if let Some(plugin) = execution.plugin_with_type_mut(plugin_type) {
            plugin.data_deleted = true;
            execution.revision += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl DatasetRepository for InMemoryRepository {
    async fn get_dataset(&self, dataset_id: &str) -> Result<Option<Dataset>> {
        Ok(self.store()?.datasets.get(dataset_id).cloned())
    }

    async fn save_dataset(&self, dataset: Dataset) -> Result<()> {
        self.store()?
            .datasets
            .insert(dataset.dataset_id.clone(), dataset);
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        Ok(self.store()?.workflows.get(workflow_id).cloned())
    }

    async fn save_workflow(&self, workflow: Workflow) -> Result<()> {
        self.store()?
            .workflows
            .insert(workflow.workflow_id.clone(), workflow);
        Ok(())
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryRepository {
    async fn get_schedule(&self, dataset_id: &str) -> Result<Option<ScheduledWorkflow>> {
        Ok(self.store()?.schedules.get(dataset_id).cloned())
    }

    async fn insert_schedule(&self, schedule: ScheduledWorkflow) -> Result<bool> {
        let mut store = self.store()?;
        if store.schedules.contains_key(&schedule.dataset_id) {
            return Ok(false);
        }
        store.schedules.insert(schedule.dataset_id.clone(), schedule);
        Ok(true)
    }

    async fn replace_schedule(&self, schedule: ScheduledWorkflow) -> Result<bool> {
        let mut store = self.store()?;
        match store.schedules.get_mut(&schedule.dataset_id) {
            Some(existing) => {
                *existing = schedule;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_schedule(&self, dataset_id: &str) -> Result<bool> {
        Ok(self.store()?.schedules.remove(dataset_id).is_some())
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledWorkflow>> {
        let store = self.store()?;
        let mut due: Vec<_> = store
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.pointer_date);
        Ok(due)
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduledWorkflow>> {
        let store = self.store()?;
        let mut all: Vec<_> = store.schedules.values().cloned().collect();
        all.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{
        DataOutputRef, PluginExecution, PluginInput, PluginMetadata, ScheduleFrequency,
    };
    use chrono::Duration;
    use std::sync::Arc;

    fn execution(dataset_id: &str) -> WorkflowExecution {
        WorkflowExecution::new(
            dataset_id,
            "wf",
            0,
            vec![PluginExecution::new(
                PluginMetadata::new(PluginType::Enrichment),
                PluginInput::Nothing,
            )],
        )
    }

    fn finished(plugin_type: PluginType, at: DateTime<Utc>) -> PluginExecution {
        let mut plugin =
            PluginExecution::new(PluginMetadata::new(plugin_type), PluginInput::Nothing);
        plugin.status = ExecutionStatus::Finished;
        plugin.finished_date = Some(at);
        plugin.data_output = Some(DataOutputRef {
            execution_id: ExecutionId::nil(),
            plugin_type,
            finished_date: at,
            location: "loc".into(),
        });
        plugin
    }

    #[tokio::test]
    async fn test_create_rejects_second_active_execution() {
        let repo = InMemoryRepository::new();
        let first = execution("1");
        let first_id = first.id;

        let outcome = repo.create_if_none_active(first).await.unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(_)));

        let outcome = repo.create_if_none_active(execution("1")).await.unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyActive(first_id));

        // A different dataset is unaffected
        let outcome = repo.create_if_none_active(execution("2")).await.unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(_)));
    }

    #[tokio::test]
    async fn test_create_allowed_after_terminal() {
        let repo = InMemoryRepository::new();
        let CreateOutcome::Created(mut stored) =
            repo.create_if_none_active(execution("1")).await.unwrap()
        else {
            panic!("expected creation");
        };
        stored.status = ExecutionStatus::Finished;
        repo.update_if_revision(&stored).await.unwrap().unwrap();

        let outcome = repo.create_if_none_active(execution("1")).await.unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(_)));
    }

    #[tokio::test]
    async fn test_concurrent_creates_leave_one_active() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.create_if_none_active(execution("race")).await.unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), CreateOutcome::Created(_)) {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert!(repo.active_for_dataset("race").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conditional_update_detects_stale_revision() {
        let repo = InMemoryRepository::new();
        let CreateOutcome::Created(stored) =
            repo.create_if_none_active(execution("1")).await.unwrap()
        else {
            panic!("expected creation");
        };

        let mut a = stored.clone();
        a.owner = Some("node-a".into());
        let updated = repo.update_if_revision(&a).await.unwrap().unwrap();
        assert_eq!(updated.revision, stored.revision + 1);

        let mut b = stored.clone();
        b.owner = Some("node-b".into());
        assert!(repo.update_if_revision(&b).await.unwrap().is_none());

        let current = repo.get_execution(stored.id).await.unwrap().unwrap();
        assert_eq!(current.owner.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_cancelling_flag_is_sticky() {
        let repo = InMemoryRepository::new();
        let CreateOutcome::Created(stored) =
            repo.create_if_none_active(execution("1")).await.unwrap()
        else {
            panic!("expected creation");
        };

        let flagged = repo.request_cancel(stored.id).await.unwrap().unwrap();
        assert!(flagged.cancelling);

        let mut update = flagged.clone();
        update.cancelling = false;
        let written = repo.update_if_revision(&update).await.unwrap().unwrap();
        assert!(written.cancelling);
    }

    #[tokio::test]
    async fn test_request_cancel_ignores_terminal() {
        let repo = InMemoryRepository::new();
        let CreateOutcome::Created(mut stored) =
            repo.create_if_none_active(execution("1")).await.unwrap()
        else {
            panic!("expected creation");
        };
        stored.status = ExecutionStatus::Failed;
        repo.update_if_revision(&stored).await.unwrap().unwrap();

        assert!(repo.request_cancel(stored.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_finished_plugin_skips_deleted() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();

        let mut older = WorkflowExecution::new(
            "1",
            "wf",
            0,
            vec![finished(PluginType::Publish, now - Duration::days(2))],
        );
        older.status = ExecutionStatus::Finished;
        let older_id = older.id;
        let mut newer = WorkflowExecution::new(
            "1",
            "wf",
            0,
            vec![finished(PluginType::Publish, now - Duration::days(1))],
        );
        newer.status = ExecutionStatus::Finished;
        let newer_id = newer.id;
        repo.create_if_none_active(older).await.unwrap();
        repo.create_if_none_active(newer).await.unwrap();

        let latest = repo
            .latest_finished_plugin("1", &[PluginType::Publish])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.execution_id, newer_id);

        repo.mark_plugin_data_deleted(newer_id, PluginType::Publish)
            .await
            .unwrap();
        let latest = repo
            .latest_finished_plugin("1", &[PluginType::Publish])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.execution_id, older_id);

        assert!(repo
            .latest_finished_plugin("1", &[PluginType::Enrichment])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_data_deleted_mark_survives_stale_writer() {
        let repo = InMemoryRepository::new();
        let execution = WorkflowExecution::new(
            "1",
            "wf",
            0,
            vec![finished(PluginType::Publish, Utc::now())],
        );
        let CreateOutcome::Created(mut copy) = repo.create_if_none_active(execution).await.unwrap()
        else {
            panic!("expected creation");
        };

        repo.mark_plugin_data_deleted(copy.id, PluginType::Publish)
            .await
            .unwrap();
        assert!(repo.update_if_revision(&copy).await.unwrap().is_none());

        copy.revision = repo.get_execution(copy.id).await.unwrap().unwrap().revision;
        let stored = repo.update_if_revision(&copy).await.unwrap().unwrap();
        assert!(!copy.plugins[0].data_deleted);
        assert!(stored.plugins[0].data_deleted);
    }

    #[tokio::test]
    async fn test_schedule_crud_and_due_listing() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let due = ScheduledWorkflow::new("1", "wf", ScheduleFrequency::Daily, now - Duration::hours(1));
        let later = ScheduledWorkflow::new("2", "wf", ScheduleFrequency::Weekly, now + Duration::hours(1));

        assert!(repo.insert_schedule(due.clone()).await.unwrap());
        assert!(!repo.insert_schedule(due.clone()).await.unwrap());
        assert!(repo.insert_schedule(later).await.unwrap());

        let listed = repo.list_due_schedules(now).await.unwrap();
        assert_eq!(listed, vec![due.clone()]);

        let mut moved = due.clone();
        moved.pointer_date = now + Duration::days(1);
        assert!(repo.replace_schedule(moved).await.unwrap());
        assert!(repo.list_due_schedules(now).await.unwrap().is_empty());

        assert!(repo.delete_schedule("1").await.unwrap());
        assert!(!repo.delete_schedule("1").await.unwrap());
        assert_eq!(repo.list_schedules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_repository_errors_are_transient() {
        let repo = InMemoryRepository::new();
        repo.set_unavailable(true);
        let err = repo.get_dataset("1").await.unwrap_err();
        assert!(err.is_transient());

        repo.set_unavailable(false);
        assert!(repo.get_dataset("1").await.unwrap().is_none());
    }
}
