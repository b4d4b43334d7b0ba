//! Runtime Assembly
//!
//! Builds the object graph of one orchestrator node from its collaborators
//! and runs its three loops: the queue consumer, the failsafe monitor and
//! the scheduler.
//!
//! # Example
//!
//! ```rust,no_run
//! use metis_orchestrator::config::OrchestratorConfig;
//! use metis_orchestrator::runtime::{Collaborators, Node};
//!
//! # async fn demo() -> metis_orchestrator::error::Result<()> {
//! let node = Node::new(OrchestratorConfig::default(), Collaborators::in_memory());
//! let running = node.start().await?;
//! // ... serve requests through running.orchestrator() ...
//! running.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::execution::{
    AdmissionController, Consumer, ExecutionManager, ProcessingService,
    SimulatedProcessingService,
};
use crate::lock::{InMemoryLockService, LockService};
use crate::monitoring::FailsafeMonitor;
use crate::orchestrator::Orchestrator;
use crate::persistence::{ExecutionRepository, InMemoryRepository, Repository};
use crate::queue::{DispatchQueue, InMemoryChannel, MessageChannel};
use crate::scheduling::Scheduler;
use crate::workflow::model::ExecutionStatus;
use crate::workflow::validator::ValidationLimits;

/// External systems a node talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn Repository>,
    pub channel: Arc<dyn MessageChannel>,
    pub locks: Arc<dyn LockService>,
    pub processing: Arc<dyn ProcessingService>,
}

impl Collaborators {
    /// Single-process collaborators with a simulated processing service.
    pub fn in_memory() -> Self {
        Self::in_memory_with(SimulatedProcessingService::default())
    }

    pub fn in_memory_with(processing: SimulatedProcessingService) -> Self {
        Self {
            repository: Arc::new(InMemoryRepository::new()),
            channel: Arc::new(InMemoryChannel::new()),
            locks: Arc::new(InMemoryLockService::new()),
            processing: Arc::new(processing),
        }
    }
}

/// A configured, not yet started node.
pub struct Node {
    config: Arc<OrchestratorConfig>,
    collaborators: Collaborators,
    queue: DispatchQueue,
    orchestrator: Orchestrator,
}

impl Node {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let queue = DispatchQueue::new(
            collaborators.channel.clone(),
            &config.queue_name,
            config.highest_priority,
        );
        let orchestrator = Orchestrator::new(
            collaborators.repository.clone(),
            queue.clone(),
            ValidationLimits {
                max_depublish_records: config.max_depublish_records,
            },
        );
        Self {
            config,
            collaborators,
            queue,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Validates the configuration, republishes queued executions and
    /// spawns the node's loops.
    pub async fn start(self) -> Result<RunningNode> {
        let Node {
            config,
            collaborators,
            queue,
            orchestrator,
        } = self;
        config.validate()?;
        info!(
            "Starting node {} ({} plugin permits)",
            config.node_id, config.max_concurrent_threads
        );

        republish_queued(collaborators.repository.as_ref(), &queue).await?;

        let (stop, shutdown) = watch::channel(false);
        let manager = Arc::new(ExecutionManager::new(
            config.clone(),
            collaborators.repository.clone(),
            queue.clone(),
            AdmissionController::new(&config),
            collaborators.processing.clone(),
        ));
        let consumer = Consumer::new(manager, queue.clone());
        let failsafe = FailsafeMonitor::new(
            config.clone(),
            collaborators.repository.clone(),
            queue.clone(),
            collaborators.locks.clone(),
            collaborators.processing.clone(),
        );
        let scheduler = Scheduler::new(
            config.clone(),
            collaborators.repository.clone(),
            orchestrator.clone(),
            collaborators.locks.clone(),
        );

        let consumer_shutdown = shutdown.clone();
        let failsafe_shutdown = shutdown.clone();
        let tasks = vec![
            tokio::spawn(async move {
                if let Err(e) = consumer.run(consumer_shutdown).await {
                    error!("Consumer stopped: {}", e);
                }
            }),
            tokio::spawn(failsafe.run(failsafe_shutdown)),
            tokio::spawn(scheduler.run(shutdown)),
        ];

        Ok(RunningNode {
            orchestrator,
            stop,
            tasks,
        })
    }
}

/// A node whose loops are running.
pub struct RunningNode {
    orchestrator: Orchestrator,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningNode {
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Stops the loops and waits for running plugins to be handed off.
    pub async fn shutdown(self) {
        info!("Shutting down");
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Loop ended abnormally: {}", e);
            }
        }
    }
}

/// Publishes every queued execution once. Messages do not survive a broker
/// restart, and the failsafe monitor only covers running executions.
async fn republish_queued(repository: &dyn Repository, queue: &DispatchQueue) -> Result<usize> {
    let queued = repository.list_with_status(ExecutionStatus::Queued).await?;
    for execution in &queued {
        queue.publish(execution.id, execution.priority).await?;
    }
    if !queued.is_empty() {
        info!("Republished {} queued execution(s)", queued.len());
    }
    Ok(queued.len())
}
