//! Scheduler
//!
//! Starts scheduled workflows whose pointer date is due, through the same
//! path as interactive requests, then moves the pointer on by the
//! schedule's frequency. One-off schedules are deleted once fired.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::lock::{LockGuard, LockService};
use crate::orchestrator::Orchestrator;
use crate::persistence::{ExecutionRepository, Repository, ScheduleRepository};
use crate::workflow::model::ScheduledWorkflow;

/// Name of the lock serializing scheduler ticks across nodes.
pub const SCHEDULER_LOCK: &str = "scheduler";

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerReport {
    pub started: usize,
    /// Due, but the dataset is busy; retried next tick
    pub deferred: usize,
    /// Rejected by validation; the pointer still moved on
    pub rejected: usize,
}

pub struct Scheduler {
    config: Arc<OrchestratorConfig>,
    repository: Arc<dyn Repository>,
    orchestrator: Orchestrator,
    locks: Arc<dyn LockService>,
}

enum Firing {
    Started,
    Deferred,
    Rejected,
}

impl Scheduler {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        repository: Arc<dyn Repository>,
        orchestrator: Orchestrator,
        locks: Arc<dyn LockService>,
    ) -> Self {
        Self {
            config,
            repository,
            orchestrator,
            locks,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Scheduler started (every {:?})",
            self.config.scheduler_interval()
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.scheduler_interval()) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!("Scheduler check failed: {}", e);
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Fires every schedule due at `now`. Returns `None` when another node
    /// holds the scheduler lock.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Option<SchedulerReport>> {
        let Some(guard) = LockGuard::try_acquire(
            self.locks.clone(),
            SCHEDULER_LOCK,
            &self.config.node_id,
            self.config.lock_lease(),
        )
        .await?
        else {
            debug!("Scheduler lock held elsewhere, skipping tick");
            return Ok(None);
        };

        let result = self.fire_due(&guard, now).await;
        if let Err(e) = guard.release().await {
            warn!("Failed to release {} lock: {}", SCHEDULER_LOCK, e);
        }
        result.map(Some)
    }

    async fn fire_due(&self, guard: &LockGuard, now: DateTime<Utc>) -> Result<SchedulerReport> {
        let mut report = SchedulerReport::default();

        for schedule in self.repository.list_due_schedules(now).await? {
            if guard.is_lost() {
                warn!("Lost the {} lock, ending tick early", SCHEDULER_LOCK);
                break;
            }
            match self.fire(&schedule).await {
                Ok(Firing::Started) => report.started += 1,
                Ok(Firing::Deferred) => report.deferred += 1,
                Ok(Firing::Rejected) => report.rejected += 1,
                Err(e) => warn!(
                    "Scheduled workflow of dataset {} not started, retrying next tick: {}",
                    schedule.dataset_id, e
                ),
            }
        }
        Ok(report)
    }

    async fn fire(&self, schedule: &ScheduledWorkflow) -> Result<Firing> {
        if let Some(active) = self
            .repository
            .active_for_dataset(&schedule.dataset_id)
            .await?
        {
            info!(
                "Dataset {} still has execution {} running, deferring its schedule",
                schedule.dataset_id, active.id
            );
            return Ok(Firing::Deferred);
        }

        let firing = match self
            .orchestrator
            .start_stored_workflow(
                &schedule.dataset_id,
                &schedule.workflow_id,
                schedule.priority,
                None,
            )
            .await
        {
            Ok(execution) => {
                info!(
                    "Scheduled workflow {} started execution {} for dataset {}",
                    schedule.workflow_id, execution.id, schedule.dataset_id
                );
                Firing::Started
            }
            Err(OrchestratorError::ExecutionAlreadyExists { .. }) => return Ok(Firing::Deferred),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(
                    "Scheduled workflow {} rejected for dataset {}: {}",
                    schedule.workflow_id, schedule.dataset_id, e
                );
                Firing::Rejected
            }
        };

        self.advance(schedule).await?;
        Ok(firing)
    }

    async fn advance(&self, schedule: &ScheduledWorkflow) -> Result<()> {
        match schedule.frequency.next_after(schedule.pointer_date) {
            Some(next) => {
                let mut moved = schedule.clone();
                moved.pointer_date = next;
                debug!(
                    "Schedule of dataset {} next due at {}",
                    schedule.dataset_id, next
                );
                self.repository.replace_schedule(moved).await?;
            }
            None => {
                self.repository.delete_schedule(&schedule.dataset_id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockService;
    use crate::persistence::{DatasetRepository, InMemoryRepository};
    use crate::queue::{DispatchQueue, InMemoryChannel};
    use crate::workflow::model::{
        Dataset, PluginMetadata, PluginType, ScheduleFrequency, Workflow,
    };
    use crate::workflow::validator::ValidationLimits;
    use chrono::{Duration, TimeZone};

    struct Setup {
        repo: Arc<InMemoryRepository>,
        channel: Arc<InMemoryChannel>,
        locks: Arc<InMemoryLockService>,
        scheduler: Scheduler,
    }

    async fn setup() -> Setup {
        let config = Arc::new(OrchestratorConfig {
            node_id: "node-a".into(),
            ..Default::default()
        });
        let repo = Arc::new(InMemoryRepository::new());
        let channel = Arc::new(InMemoryChannel::new());
        let queue = DispatchQueue::new(channel.clone(), "metis.workflows", 10);
        let orchestrator = Orchestrator::new(repo.clone(), queue, ValidationLimits::default());
        let locks = Arc::new(InMemoryLockService::new());
        let scheduler = Scheduler::new(config, repo.clone(), orchestrator, locks.clone());

        repo.save_dataset(Dataset::new("1", "Maps")).await.unwrap();
        repo.save_workflow(
            Workflow::new("ingest").with_plugin(
                PluginMetadata::new(PluginType::HttpHarvest).with_url("https://example.org/a.zip"),
            ),
        )
        .await
        .unwrap();
        Setup {
            repo,
            channel,
            locks,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_lost_lock_stops_firing() {
        let s = setup().await;
        let now = Utc::now();
        let pointer = now - Duration::minutes(1);
        s.repo
            .insert_schedule(ScheduledWorkflow::new(
                "1",
                "ingest",
                ScheduleFrequency::Daily,
                pointer,
            ))
            .await
            .unwrap();

        let lease = std::time::Duration::from_millis(30);
        let guard = LockGuard::try_acquire(s.locks.clone(), SCHEDULER_LOCK, "node-a", lease)
            .await
            .unwrap()
            .unwrap();
        s.locks.try_lock(SCHEDULER_LOCK, "node-a", lease).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(guard.is_lost());

        let report = s.scheduler.fire_due(&guard, now).await.unwrap();
        assert_eq!(report, SchedulerReport::default());
        assert!(s.channel.is_empty());
        let schedule = s.repo.get_schedule("1").await.unwrap().unwrap();
        assert_eq!(schedule.pointer_date, pointer);
    }

    #[tokio::test]
    async fn test_daily_schedule_fires_and_advances_one_day() {
        let s = setup().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let pointer = now - Duration::hours(2);
        s.repo
            .insert_schedule(ScheduledWorkflow::new(
                "1",
                "ingest",
                ScheduleFrequency::Daily,
                pointer,
            ))
            .await
            .unwrap();

        let report = s.scheduler.tick(now).await.unwrap().unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(s.channel.len(), 1);

        let schedule = s.repo.get_schedule("1").await.unwrap().unwrap();
        assert_eq!(schedule.pointer_date, pointer + Duration::days(1));

        // Not due again within the same day
        let report = s.scheduler.tick(now).await.unwrap().unwrap();
        assert_eq!(report, SchedulerReport::default());
        assert_eq!(s.channel.len(), 1);
    }

    #[tokio::test]
    async fn test_busy_dataset_deferred_without_moving_pointer() {
        let s = setup().await;
        let now = Utc::now();
        let pointer = now - Duration::minutes(1);
        s.repo
            .insert_schedule(ScheduledWorkflow::new(
                "1",
                "ingest",
                ScheduleFrequency::Weekly,
                pointer,
            ))
            .await
            .unwrap();
        s.repo
            .create_if_none_active(crate::workflow::model::WorkflowExecution::new(
                "1",
                "other",
                0,
                vec![],
            ))
            .await
            .unwrap();

        let report = s.scheduler.tick(now).await.unwrap().unwrap();
        assert_eq!(report.deferred, 1);
        assert!(s.channel.is_empty());
        let schedule = s.repo.get_schedule("1").await.unwrap().unwrap();
        assert_eq!(schedule.pointer_date, pointer);
    }

    #[tokio::test]
    async fn test_once_schedule_deleted_after_firing() {
        let s = setup().await;
        let now = Utc::now();
        s.repo
            .insert_schedule(ScheduledWorkflow::new(
                "1",
                "ingest",
                ScheduleFrequency::Once,
                now - Duration::seconds(5),
            ))
            .await
            .unwrap();

        let report = s.scheduler.tick(now).await.unwrap().unwrap();
        assert_eq!(report.started, 1);
        assert!(s.repo.get_schedule("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_workflow_still_advances() {
        let s = setup().await;
        s.repo
            .save_workflow(Workflow::new("broken").with_type(PluginType::Publish))
            .await
            .unwrap();
        let now = Utc::now();
        let pointer = now - Duration::seconds(5);
        s.repo
            .insert_schedule(ScheduledWorkflow::new(
                "1",
                "broken",
                ScheduleFrequency::Daily,
                pointer,
            ))
            .await
            .unwrap();

        let report = s.scheduler.tick(now).await.unwrap().unwrap();
        assert_eq!(report.rejected, 1);
        assert!(s.channel.is_empty());
        let schedule = s.repo.get_schedule("1").await.unwrap().unwrap();
        assert_eq!(schedule.pointer_date, pointer + Duration::days(1));
    }

    #[tokio::test]
    async fn test_unavailable_repository_keeps_schedule() {
        let s = setup().await;
        let now = Utc::now();
        let pointer = now - Duration::seconds(5);
        s.repo
            .insert_schedule(ScheduledWorkflow::new(
                "1",
                "ingest",
                ScheduleFrequency::Daily,
                pointer,
            ))
            .await
            .unwrap();

        s.repo.set_unavailable(true);
        assert!(s.scheduler.tick(now).await.unwrap_err().is_transient());
        s.repo.set_unavailable(false);

        let schedule = s.repo.get_schedule("1").await.unwrap().unwrap();
        assert_eq!(schedule.pointer_date, pointer);
    }
}
