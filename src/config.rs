//! Orchestrator Configuration
//!
//! A single immutable configuration struct, loaded from YAML and passed to
//! every component at construction time.
//!
//! # Example YAML Format
//!
//! ```yaml
//! max_concurrent_threads: 8
//! plugin_permits:
//!   MEDIA_PROCESS: 2
//! monitor_check_interval_millis: 5000
//! failsafe_margin_of_inactivity_secs: 300
//! queue_name: metis.workflows
//! highest_priority: 10
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::workflow::model::PluginType;

/// Default node identity: host name plus a per-process suffix.
static DEFAULT_NODE_ID: Lazy<String> = Lazy::new(|| {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
});

/// Runtime configuration of the orchestrator.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Identity of this node as lock holder and execution owner
    pub node_id: String,

    /// Total plugin permits in this process
    pub max_concurrent_threads: usize,

    /// Per-type permit overrides, clamped to `max_concurrent_threads`
    pub plugin_permits: HashMap<PluginType, usize>,

    /// How long the consumer waits for a permit before requeueing
    pub admission_timeout_millis: u64,

    /// Interval between status polls of a running plugin
    pub monitor_check_interval_millis: u64,

    pub external_connect_timeout_millis: u64,
    pub external_read_timeout_millis: u64,

    pub failsafe_check_interval_millis: u64,
    pub failsafe_margin_of_inactivity_secs: u64,

    /// Re-dispatches allowed before a stuck plugin is failed
    pub max_recovery_attempts: u32,

    pub scheduler_check_interval_millis: u64,

    pub queue_name: String,

    /// Highest accepted priority; lower values are dispatched later
    pub highest_priority: u8,

    pub lock_lease_secs: u64,

    /// Upper bound of records in one record depublication
    pub max_depublish_records: usize,

    /// Cancel a plugin whose processed count has not moved for this long
    pub no_progress_cancel_after_millis: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            node_id: DEFAULT_NODE_ID.clone(),
            max_concurrent_threads: num_cpus::get().max(1),
            plugin_permits: HashMap::new(),
            admission_timeout_millis: 30_000,
            monitor_check_interval_millis: 5_000,
            external_connect_timeout_millis: 10_000,
            external_read_timeout_millis: 30_000,
            failsafe_check_interval_millis: 60_000,
            failsafe_margin_of_inactivity_secs: 300,
            max_recovery_attempts: 3,
            scheduler_check_interval_millis: 90_000,
            queue_name: "metis.workflows".to_string(),
            highest_priority: 10,
            lock_lease_secs: 30,
            max_depublish_records: 1000,
            no_progress_cancel_after_millis: None,
        }
    }
}

impl OrchestratorConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to a YAML file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!(
                "Failed to read configuration file '{}': {}",
                path.display(),
                e
            ))
        })?;
        debug!("Configuration loaded ({} bytes)", content.len());

        Self::from_yaml(&content)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| OrchestratorError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every interval is non-zero and the permit layout fits.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(OrchestratorError::Config("node_id must not be empty".into()));
        }
        if self.max_concurrent_threads == 0 {
            return Err(OrchestratorError::Config(
                "max_concurrent_threads must be at least 1".into(),
            ));
        }
        let intervals = [
            ("monitor_check_interval_millis", self.monitor_check_interval_millis),
            ("failsafe_check_interval_millis", self.failsafe_check_interval_millis),
            ("scheduler_check_interval_millis", self.scheduler_check_interval_millis),
            ("lock_lease_secs", self.lock_lease_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(OrchestratorError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.highest_priority == 0 {
            return Err(OrchestratorError::Config(
                "highest_priority must be at least 1".into(),
            ));
        }
        if self.queue_name.trim().is_empty() {
            return Err(OrchestratorError::Config("queue_name must not be empty".into()));
        }
        for (plugin_type, permits) in &self.plugin_permits {
            if *permits == 0 || *permits > self.max_concurrent_threads {
                return Err(OrchestratorError::Config(format!(
                    "permits for {} must be between 1 and {}",
                    plugin_type, self.max_concurrent_threads
                )));
            }
        }
        Ok(())
    }

    /// Permits available to one plugin type. Never less than one, even on
    /// a config that did not pass [`validate`](Self::validate).
    pub fn permits_for(&self, plugin_type: PluginType) -> usize {
        self.plugin_permits
            .get(&plugin_type)
            .copied()
            .unwrap_or(self.max_concurrent_threads)
            .min(self.max_concurrent_threads)
            .max(1)
    }

    /// Maximum silence before a running execution counts as stuck.
    ///
    /// Sum of the external connect and read timeouts, the monitor poll
    /// interval and the inactivity margin.
    pub fn failsafe_leniency(&self) -> Duration {
        Duration::from_millis(self.external_connect_timeout_millis)
            + Duration::from_millis(self.external_read_timeout_millis)
            + Duration::from_millis(self.monitor_check_interval_millis)
            + Duration::from_secs(self.failsafe_margin_of_inactivity_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_check_interval_millis)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_millis)
    }

    pub fn failsafe_interval(&self) -> Duration {
        Duration::from_millis(self.failsafe_check_interval_millis)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_check_interval_millis)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn no_progress_limit(&self) -> Option<Duration> {
        self.no_progress_cancel_after_millis.map(Duration::from_millis)
    }
}
