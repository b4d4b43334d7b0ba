//! In-Memory Priority Channel
//!
//! A non-durable broker stand-in: a binary heap ordered by priority, with a
//! `Notify` waking the blocked consumer.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Delivery, DispatchMessage, MessageChannel};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    message: DispatchMessage,
    sequence: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, then earlier publication
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct ChannelState {
    ready: BinaryHeap<Entry>,
    unacked: HashMap<u64, DispatchMessage>,
    next_sequence: u64,
    next_tag: u64,
}

/// Priority channel living in process memory.
#[derive(Default)]
pub struct InMemoryChannel {
    state: Mutex<ChannelState>,
    available: Notify,
    unavailable: AtomicBool,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes publishing fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages waiting to be consumed.
    pub fn len(&self) -> usize {
        self.state().map(|s| s.ready.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages consumed but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.state().map(|s| s.unacked.len()).unwrap_or(0)
    }

    /// Removes every waiting message and returns them in dispatch order.
    pub fn drain(&self) -> Vec<DispatchMessage> {
        match self.state() {
            Ok(mut state) => {
                let mut drained = Vec::with_capacity(state.ready.len());
                while let Some(entry) = state.ready.pop() {
                    drained.push(entry.message);
                }
                drained
            }
            Err(_) => Vec::new(),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, ChannelState>> {
        self.state
            .lock()
            .map_err(|_| OrchestratorError::Queue("channel lock poisoned".to_string()))
    }

    fn try_pop(&self) -> Result<Option<Delivery>> {
        let mut state = self.state()?;
        let Some(entry) = state.ready.pop() else {
            return Ok(None);
        };
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(tag, entry.message);
        Ok(Some(Delivery {
            tag,
            message: entry.message,
        }))
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn publish(&self, message: DispatchMessage) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Queue("broker unavailable".to_string()));
        }
        {
            let mut state = self.state()?;
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            state.ready.push(Entry { message, sequence });
        }
        self.available.notify_one();
        Ok(())
    }

    async fn consume(&self) -> Result<Delivery> {
        loop {
            if let Some(delivery) = self.try_pop()? {
                return Ok(delivery);
            }
            self.available.notified().await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.state()?.unacked.remove(&tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn message(priority: u8) -> DispatchMessage {
        DispatchMessage {
            execution_id: Uuid::new_v4(),
            priority,
        }
    }

    #[tokio::test]
    async fn test_higher_priority_consumed_first() {
        let channel = InMemoryChannel::new();
        let low = message(1);
        let high = message(9);
        let mid = message(5);
        channel.publish(low).await.unwrap();
        channel.publish(high).await.unwrap();
        channel.publish(mid).await.unwrap();

        assert_eq!(channel.consume().await.unwrap().message, high);
        assert_eq!(channel.consume().await.unwrap().message, mid);
        assert_eq!(channel.consume().await.unwrap().message, low);
    }

    #[tokio::test]
    async fn test_consume_waits_for_publish() {
        let channel = Arc::new(InMemoryChannel::new());
        let consumer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.consume().await.unwrap() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        let sent = message(3);
        channel.publish(sent).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message, sent);
    }

    #[tokio::test]
    async fn test_ack_clears_unacked() {
        let channel = InMemoryChannel::new();
        channel.publish(message(0)).await.unwrap();
        let delivery = channel.consume().await.unwrap();
        assert_eq!(channel.unacked(), 1);
        channel.ack(delivery.tag).await.unwrap();
        assert_eq!(channel.unacked(), 0);
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_channel_rejects_publish() {
        let channel = InMemoryChannel::new();
        channel.set_unavailable(true);
        assert!(channel.publish(message(0)).await.unwrap_err().is_transient());
    }
}
