//! Queue Consumer
//!
//! The single consumer of this process. Each delivery is prepared inline
//! (so a busy plugin type holds the consumer for at most the admission
//! timeout) and, once claimed, run on its own task.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::manager::{DequeueOutcome, ExecutionManager};
use crate::error::Result;
use crate::queue::{DispatchQueue, Delivery};

pub struct Consumer {
    manager: Arc<ExecutionManager>,
    queue: DispatchQueue,
}

impl Consumer {
    pub fn new(manager: Arc<ExecutionManager>, queue: DispatchQueue) -> Self {
        Self { manager, queue }
    }

    /// Consumes until `shutdown` turns true, then waits for running plugins.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Consuming from {}", self.queue.queue_name());
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Execution task panicked: {}", e);
                    }
                }
                delivery = self.queue.consume() => {
                    match delivery {
                        Ok(delivery) => self.handle(delivery, &mut tasks).await,
                        Err(e) => {
                            warn!("Consuming from {} failed: {}", self.queue.queue_name(), e);
                            tokio::time::sleep(self.manager.config().monitor_interval()).await;
                        }
                    }
                }
            }
        }

        info!("Consumer stopping, waiting for {} running plugin(s)", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Execution task panicked: {}", e);
            }
        }
        Ok(())
    }

    async fn handle(&self, delivery: Delivery, tasks: &mut JoinSet<()>) {
        let execution_id = delivery.message.execution_id;
        debug!(
            "Received execution {} (priority {})",
            execution_id, delivery.message.priority
        );

        match self.manager.prepare(execution_id).await {
            Ok(DequeueOutcome::Ready(run)) => {
                let manager = self.manager.clone();
                tasks.spawn(async move {
                    if let Err(e) = manager.run(run).await {
                        error!("Execution {} stopped with an error: {}", execution_id, e);
                    }
                });
            }
            Ok(outcome) => debug!("Execution {}: {:?}", execution_id, outcome),
            Err(e) => error!("Could not prepare execution {}: {}", execution_id, e),
        }

        // Acknowledged regardless of the outcome; lost work is recovered
        // by the failsafe monitor
        if let Err(e) = self.queue.ack(delivery.tag).await {
            warn!("Failed to acknowledge delivery {}: {}", delivery.tag, e);
        }
    }
}
