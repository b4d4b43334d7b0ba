//! In-memory lease store.
//!
//! Holders share one process, so this only coordinates tasks or simulated
//! nodes inside it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{LockAttempt, LockService};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    token: String,
    expires_at: DateTime<Utc>,
}

/// Lease table kept behind a `RwLock`.
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    leases: RwLock<HashMap<String, Lease>>,
}

fn poison_err<T>(_: PoisonError<T>) -> OrchestratorError {
    OrchestratorError::Lock("lease table poisoned".to_string())
}

fn expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30))
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live holder of a lock.
    pub fn holder(&self, name: &str) -> Result<Option<String>> {
        let leases = self.leases.read().map_err(poison_err)?;
        let now = Utc::now();
        Ok(leases
            .get(name)
            .filter(|l| l.expires_at > now)
            .map(|l| l.holder.clone()))
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn try_lock(&self, name: &str, holder: &str, lease: Duration) -> Result<LockAttempt> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Utc::now();

        if let Some(current) = leases.get(name) {
            if current.expires_at > now && current.holder != holder {
                return Ok(LockAttempt::Busy {
                    holder: current.holder.clone(),
                });
            }
        }

        let token = Uuid::new_v4().to_string();
        leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                token: token.clone(),
                expires_at: expiry(now, lease),
            },
        );
        Ok(LockAttempt::Acquired { token })
    }

    async fn renew(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Utc::now();

        match leases.get_mut(name) {
            Some(current) if current.token == token && current.expires_at > now => {
                current.expires_at = expiry(now, lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let held = leases.get(name).is_some_and(|l| l.token == token);
        if held {
            leases.remove(name);
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_holder_is_busy() {
        let service = InMemoryLockService::new();
        let lease = Duration::from_secs(30);

        let first = service.try_lock("failsafe", "node-a", lease).await.unwrap();
        assert!(matches!(first, LockAttempt::Acquired { .. }));

        let second = service.try_lock("failsafe", "node-b", lease).await.unwrap();
        assert_eq!(
            second,
            LockAttempt::Busy {
                holder: "node-a".to_string()
            }
        );
        assert_eq!(service.holder("failsafe").unwrap().as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_same_holder_reacquires() {
        let service = InMemoryLockService::new();
        let lease = Duration::from_secs(30);
        service.try_lock("failsafe", "node-a", lease).await.unwrap();
        let again = service.try_lock("failsafe", "node-a", lease).await.unwrap();
        assert!(matches!(again, LockAttempt::Acquired { .. }));
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let service = InMemoryLockService::new();
        let lease = Duration::from_secs(30);
        let LockAttempt::Acquired { token } =
            service.try_lock("scheduler", "node-a", lease).await.unwrap()
        else {
            panic!("expected lease");
        };

        assert!(!service.release("scheduler", "bogus").await.unwrap());
        assert!(service.release("scheduler", &token).await.unwrap());
        assert!(service.holder("scheduler").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_fails_after_expiry() {
        let service = InMemoryLockService::new();
        let lease = Duration::from_millis(20);
        let LockAttempt::Acquired { token } =
            service.try_lock("scheduler", "node-a", lease).await.unwrap()
        else {
            panic!("expected lease");
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!service.renew("scheduler", &token, lease).await.unwrap());
        let taken = service.try_lock("scheduler", "node-b", lease).await.unwrap();
        assert!(matches!(taken, LockAttempt::Acquired { .. }));
    }
}
