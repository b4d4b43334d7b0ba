//! Distributed Lock Service
//!
//! Lease-based mutual exclusion used by the cluster-wide periodic loops
//! (failsafe monitor and scheduler) so that one node runs each tick.
//!
//! # Structure
//!
//! - [`LockService`]: try-lock / renew / release on named leases
//! - [`LockGuard`]: a held lease renewed in the background until released
//! - [`memory`]: in-process implementation
//!
//! A lease expires on its own if the holder stops renewing it, so a crashed
//! node cannot block the loops forever. This is a mutual-exclusion lock,
//! not a data lock.

pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::error::Result;

pub use memory::InMemoryLockService;

/// Result of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The lease is held; the token proves ownership
    Acquired { token: String },
    /// Another holder owns a live lease
    Busy { holder: String },
}

/// Named lease provider.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Takes the lease unless another holder has a live one.
    async fn try_lock(&self, name: &str, holder: &str, lease: Duration) -> Result<LockAttempt>;

    /// Extends a live lease. Returns false if the lease was lost.
    async fn renew(&self, name: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Gives the lease up. Returns false if it was no longer held.
    async fn release(&self, name: &str, token: &str) -> Result<bool>;
}

/// A held lease, renewed every third of its duration.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    name: String,
    token: String,
    lost: Arc<AtomicBool>,
    renewal: JoinHandle<()>,
}

impl LockGuard {
    /// Tries to take the named lease without waiting.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(guard))` - The lease is held until the guard is released or dropped
    /// * `Ok(None)` - Another node holds it; skip this tick
    pub async fn try_acquire(
        service: Arc<dyn LockService>,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<Option<Self>> {
        let token = match service.try_lock(name, holder, lease).await? {
            LockAttempt::Acquired { token } => token,
            LockAttempt::Busy { holder } => {
                debug!("Lock '{}' busy, held by {}", name, holder);
                return Ok(None);
            }
        };

        let lost = Arc::new(AtomicBool::new(false));
        let renewal = tokio::spawn(renew_until_lost(
            service.clone(),
            name.to_string(),
            token.clone(),
            lease,
            lost.clone(),
        ));

        Ok(Some(Self {
            service,
            name: name.to_string(),
            token,
            lost,
            renewal,
        }))
    }

    /// True once a renewal failed and the lease may be held by someone else.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stops renewing and gives the lease back.
    pub async fn release(self) -> Result<bool> {
        self.renewal.abort();
        self.service.release(&self.name, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Unreleased leases simply expire
        self.renewal.abort();
    }
}

async fn renew_until_lost(
    service: Arc<dyn LockService>,
    name: String,
    token: String,
    lease: Duration,
    lost: Arc<AtomicBool>,
) {
    let period = (lease / 3).max(Duration::from_millis(1));
    loop {
        tokio::time::sleep(period).await;
        match service.renew(&name, &token, lease).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Lost lease on lock '{}'", name);
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                // Keep trying; the lease expires on its own if this persists
                warn!("Failed to renew lock '{}': {}", name, e);
            }
        }
    }
}
