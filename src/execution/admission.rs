//! Admission Controller
//!
//! Bounds how many plugins of each type run at once. Every type has its own
//! counting semaphore, and all types together share a pool sized by
//! `max_concurrent_threads`.
//!
//! The bound is per process. With several nodes the cluster-wide total is
//! the sum of the node pools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::OrchestratorConfig;
use crate::workflow::model::PluginType;

/// Permission to run one plugin. Released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    plugin_type: PluginType,
    _type_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }
}

/// Per-plugin-type semaphore pool.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    global: Arc<Semaphore>,
    per_type: HashMap<PluginType, Arc<Semaphore>>,
    limits: HashMap<PluginType, usize>,
    max_concurrent: usize,
}

impl AdmissionController {
    /// Builds the pool from the configured limits.
    pub fn new(config: &OrchestratorConfig) -> Self {
        let max_concurrent = config.max_concurrent_threads.max(1);
        let limits: HashMap<_, _> = PluginType::ALL
            .iter()
            .map(|t| (*t, config.permits_for(*t)))
            .collect();
        let per_type = limits
            .iter()
            .map(|(t, n)| (*t, Arc::new(Semaphore::new(*n))))
            .collect();

        debug!(
            "Admission pool: {} permits total, limits {:?}",
            max_concurrent, limits
        );

        Self {
            global: Arc::new(Semaphore::new(max_concurrent)),
            per_type,
            limits,
            max_concurrent,
        }
    }

    /// Waits up to `timeout` for a permit of the given type.
    ///
    /// # Returns
    ///
    /// * `Some(permit)` - The plugin may start
    /// * `None` - Timed out; the caller requeues the execution
    pub async fn try_acquire(
        &self,
        plugin_type: PluginType,
        timeout: Duration,
    ) -> Option<AdmissionPermit> {
        let type_semaphore = self.per_type.get(&plugin_type)?.clone();
        let global = self.global.clone();

        // Type permit first, then the shared pool, always in this order
        let acquire = async move {
            let type_permit = type_semaphore.acquire_owned().await.ok()?;
            let global_permit = global.acquire_owned().await.ok()?;
            Some(AdmissionPermit {
                plugin_type,
                _type_permit: type_permit,
                _global_permit: global_permit,
            })
        };

        match tokio::time::timeout(timeout, acquire).await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Timed out waiting for a {} permit", plugin_type);
                None
            }
        }
    }

    /// Returns a permit to the pool.
    pub fn release(&self, permit: AdmissionPermit) {
        debug!("Releasing {} permit", permit.plugin_type);
        drop(permit);
    }

    /// Permits of a type currently held.
    pub fn in_use(&self, plugin_type: PluginType) -> usize {
        let limit = self.limit(plugin_type);
        let available = self
            .per_type
            .get(&plugin_type)
            .map(|s| s.available_permits())
            .unwrap_or(limit);
        limit.saturating_sub(available)
    }

    pub fn limit(&self, plugin_type: PluginType) -> usize {
        self.limits.get(&plugin_type).copied().unwrap_or(0)
    }

    pub fn total_in_use(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.global.available_permits())
    }
}
