//! Dispatch Queue
//!
//! Publishes execution ids onto a priority message channel and hands them
//! to the single consumer of this process.
//!
//! # Structure
//!
//! - [`MessageChannel`]: the broker capability (publish, blocking consume, ack)
//! - [`DispatchQueue`]: the client used by the rest of the orchestrator
//! - [`memory`]: non-durable in-process priority channel
//!
//! Delivery is at most once. Lost messages are recovered by the failsafe
//! monitor and by the startup re-publish of queued executions.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::workflow::model::ExecutionId;

pub use memory::InMemoryChannel;

/// Message transported by the channel.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchMessage {
    pub execution_id: ExecutionId,
    pub priority: u8,
}

/// A consumed message awaiting acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub message: DispatchMessage,
}

/// Priority-capable broker channel.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn publish(&self, message: DispatchMessage) -> Result<()>;

    /// Waits until a message is available. Higher priorities come first.
    async fn consume(&self) -> Result<Delivery>;

    async fn ack(&self, tag: u64) -> Result<()>;
}

/// Client for the shared dispatch channel.
#[derive(Clone)]
pub struct DispatchQueue {
    channel: Arc<dyn MessageChannel>,
    queue_name: String,
    highest_priority: u8,
}

impl DispatchQueue {
    pub fn new(channel: Arc<dyn MessageChannel>, queue_name: impl Into<String>, highest_priority: u8) -> Self {
        Self {
            channel,
            queue_name: queue_name.into(),
            highest_priority,
        }
    }

    /// Publishes an execution id. Priorities above the configured maximum
    /// are clamped.
    pub async fn publish(&self, execution_id: ExecutionId, priority: u8) -> Result<()> {
        let priority = priority.min(self.highest_priority);
        debug!(
            "Publishing execution {} to {} with priority {}",
            execution_id, self.queue_name, priority
        );
        self.channel
            .publish(DispatchMessage {
                execution_id,
                priority,
            })
            .await
    }

    pub async fn consume(&self) -> Result<Delivery> {
        self.channel.consume().await
    }

    pub async fn ack(&self, tag: u64) -> Result<()> {
        self.channel.ack(tag).await
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}
