//! Workflow Data Model
//!
//! Core data structures for pipeline definitions, their executions, and
//! the schedules that trigger them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workflow_id: full-ingest
//! plugins:
//!   - plugin_type: HTTP_HARVEST
//!     url: https://provider.example.org/export.zip
//!
//!   - plugin_type: VALIDATION_EXTERNAL
//!
//!   - plugin_type: TRANSFORMATION
//!
//!   - plugin_type: LINK_CHECKING
//!     enabled: false
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a [`WorkflowExecution`].
pub type ExecutionId = Uuid;

/// The kind of work a pipeline stage performs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginType {
    OaipmhHarvest,
    HttpHarvest,
    ValidationExternal,
    Transformation,
    ValidationInternal,
    Normalization,
    Enrichment,
    MediaProcess,
    LinkChecking,
    Preview,
    Publish,
    Depublish,
}

impl PluginType {
    /// Every plugin type, in data-evolution order.
    pub const ALL: [PluginType; 12] = [
        PluginType::OaipmhHarvest,
        PluginType::HttpHarvest,
        PluginType::ValidationExternal,
        PluginType::Transformation,
        PluginType::ValidationInternal,
        PluginType::Normalization,
        PluginType::Enrichment,
        PluginType::MediaProcess,
        PluginType::LinkChecking,
        PluginType::Preview,
        PluginType::Publish,
        PluginType::Depublish,
    ];

    /// Returns the canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OaipmhHarvest => "OAIPMH_HARVEST",
            Self::HttpHarvest => "HTTP_HARVEST",
            Self::ValidationExternal => "VALIDATION_EXTERNAL",
            Self::Transformation => "TRANSFORMATION",
            Self::ValidationInternal => "VALIDATION_INTERNAL",
            Self::Normalization => "NORMALIZATION",
            Self::Enrichment => "ENRICHMENT",
            Self::MediaProcess => "MEDIA_PROCESS",
            Self::LinkChecking => "LINK_CHECKING",
            Self::Preview => "PREVIEW",
            Self::Publish => "PUBLISH",
            Self::Depublish => "DEPUBLISH",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        PluginType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("Unknown plugin type: '{}'", s))
    }
}

/// Lifecycle state shared by workflow executions and plugin executions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Configuration of one stage inside a workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PluginMetadata {
    /// The kind of work this stage performs
    pub plugin_type: PluginType,

    /// Disabled stages are dropped when the pipeline is built
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Source location for harvest stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// OAI-PMH metadata prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_format: Option<String>,

    /// OAI-PMH set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_spec: Option<String>,

    /// Depublish the whole dataset instead of individual records
    #[serde(default)]
    pub dataset_depublish: bool,

    /// Records to depublish when `dataset_depublish` is false
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub record_ids: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl PluginMetadata {
    /// Creates enabled metadata for a plugin type with no parameters.
    pub fn new(plugin_type: PluginType) -> Self {
        Self {
            plugin_type,
            enabled: true,
            url: None,
            metadata_format: None,
            set_spec: None,
            dataset_depublish: false,
            record_ids: Vec::new(),
        }
    }

    /// Sets the harvest URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the records to depublish.
    pub fn with_record_ids(mut self, ids: Vec<String>) -> Self {
        self.record_ids = ids;
        self
    }

    /// Marks a depublish stage as a whole-dataset depublication.
    pub fn depublish_dataset(mut self) -> Self {
        self.dataset_depublish = true;
        self
    }

    /// Enables or disables the stage.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A stored pipeline definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    /// Unique identifier of the definition
    pub workflow_id: String,

    /// Ordered stages
    #[serde(default)]
    pub plugins: Vec<PluginMetadata>,
}

impl Workflow {
    /// Creates an empty workflow definition.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into().trim().to_string(),
            plugins: Vec::new(),
        }
    }

    /// Appends a stage.
    pub fn with_plugin(mut self, plugin: PluginMetadata) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Appends a parameterless stage of the given type.
    pub fn with_type(self, plugin_type: PluginType) -> Self {
        self.with_plugin(PluginMetadata::new(plugin_type))
    }

    /// Returns the stages that will actually run.
    pub fn enabled_plugins(&self) -> Vec<&PluginMetadata> {
        self.plugins.iter().filter(|p| p.enabled).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Reference to a record set produced by a finished plugin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataOutputRef {
    /// Execution that produced the records
    pub execution_id: ExecutionId,
    /// Plugin that produced the records
    pub plugin_type: PluginType,
    /// When the producing plugin finished (the revision timestamp)
    pub finished_date: DateTime<Utc>,
    /// Location handle understood by the processing service
    pub location: String,
}

/// Where a plugin reads its records from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginInput {
    /// Raw records at the provider (harvest stages)
    HarvestSource { url: String },
    /// Output of a plugin from an earlier execution of the dataset
    History { output: DataOutputRef },
    /// Output of an earlier plugin of this execution, known only once it finished
    Predecessor { plugin_type: PluginType },
    /// No record input (depublication)
    Nothing,
}

/// Record counters reported by the processing service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionProgress {
    pub processed_records: u64,
    pub error_records: u64,
}

impl ExecutionProgress {
    /// A plugin output is usable downstream only if some records made it through.
    pub fn has_successful_records(&self) -> bool {
        self.processed_records > self.error_records
    }
}

/// One pipeline stage instance inside a [`WorkflowExecution`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PluginExecution {
    pub plugin_type: PluginType,
    pub metadata: PluginMetadata,
    pub status: ExecutionStatus,
    pub input: PluginInput,

    /// Handle into the external processing service
    #[serde(default)]
    pub external_task_id: Option<String>,

    #[serde(default)]
    pub started_date: Option<DateTime<Utc>>,

    /// Heartbeat, refreshed on every poll
    #[serde(default)]
    pub updated_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub data_output: Option<DataOutputRef>,

    #[serde(default)]
    pub progress: ExecutionProgress,

    #[serde(default)]
    pub fail_message: Option<String>,

    /// Set when a later dataset depublication invalidated this output
    #[serde(default)]
    pub data_deleted: bool,
}

impl PluginExecution {
    /// Creates a queued plugin execution.
    pub fn new(metadata: PluginMetadata, input: PluginInput) -> Self {
        Self {
            plugin_type: metadata.plugin_type,
            metadata,
            status: ExecutionStatus::Queued,
            input,
            external_task_id: None,
            started_date: None,
            updated_date: None,
            finished_date: None,
            data_output: None,
            progress: ExecutionProgress::default(),
            fail_message: None,
            data_deleted: false,
        }
    }

    /// Marks the plugin failed with a message.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Failed;
        self.fail_message = Some(message.into());
        self.updated_date = Some(now);
        self.finished_date = None;
    }

    /// Marks a plugin that never got to run (or was abandoned) as cancelled.
    pub fn cancel(&mut self, message: Option<String>, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Cancelled;
        self.fail_message = message;
        self.updated_date = Some(now);
    }
}

/// One run of a pipeline against one dataset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub dataset_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub priority: u8,

    /// Sticky cancellation request, turned into `Cancelled` by the execution manager
    #[serde(default)]
    pub cancelling: bool,

    /// Node currently driving the execution, `None` between plugins
    #[serde(default)]
    pub owner: Option<String>,

    /// Version used for conditional writes; bumped by the repository on every update
    #[serde(default)]
    pub revision: u64,

    /// Failsafe re-dispatches since the last completed plugin
    #[serde(default)]
    pub recovery_attempts: u32,

    pub created_date: DateTime<Utc>,
    #[serde(default)]
    pub started_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_date: Option<DateTime<Utc>>,

    /// Fixed at creation time, never reordered
    pub plugins: Vec<PluginExecution>,
}

impl WorkflowExecution {
    /// Creates a queued execution with a fresh id.
    pub fn new(
        dataset_id: impl Into<String>,
        workflow_id: impl Into<String>,
        priority: u8,
        plugins: Vec<PluginExecution>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id: dataset_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Queued,
            priority,
            cancelling: false,
            owner: None,
            revision: 0,
            recovery_attempts: 0,
            created_date: Utc::now(),
            started_date: None,
            updated_date: None,
            finished_date: None,
            plugins,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Index of the first plugin that has not reached a terminal state.
    pub fn current_plugin_index(&self) -> Option<usize> {
        self.plugins.iter().position(|p| !p.status.is_terminal())
    }

    /// The plugin currently marked running, if any.
    pub fn running_plugin(&self) -> Option<&PluginExecution> {
        self.plugins
            .iter()
            .find(|p| p.status == ExecutionStatus::Running)
    }

    /// Latest liveness signal: the running plugin's heartbeat, or the
    /// execution's own update time between plugins.
    pub fn heartbeat(&self) -> Option<DateTime<Utc>> {
        self.running_plugin()
            .and_then(|p| p.updated_date)
            .or(self.updated_date)
            .or(self.started_date)
    }

    /// First failed plugin and when it failed.
    pub fn failure_point(&self) -> Option<(PluginType, Option<DateTime<Utc>>)> {
        self.plugins
            .iter()
            .find(|p| p.status == ExecutionStatus::Failed)
            .map(|p| (p.plugin_type, p.updated_date))
    }

    /// Most recent finished plugin of this execution with one of the given types.
    pub fn latest_finished_of(&self, types: &[PluginType]) -> Option<&PluginExecution> {
        self.plugins
            .iter()
            .rev()
            .find(|p| p.status == ExecutionStatus::Finished && types.contains(&p.plugin_type))
    }

    pub fn plugin_with_type_mut(&mut self, plugin_type: PluginType) -> Option<&mut PluginExecution> {
        self.plugins.iter_mut().find(|p| p.plugin_type == plugin_type)
    }

    /// Cancels the execution and every plugin that has not reached a terminal state.
    pub fn cancel_all(&mut self, now: DateTime<Utc>) {
        for plugin in &mut self.plugins {
            if !plugin.status.is_terminal() {
                plugin.cancel(None, now);
            }
        }
        self.status = ExecutionStatus::Cancelled;
        self.owner = None;
        self.updated_date = Some(now);
        self.finished_date = Some(now);
    }
}

/// How well a dataset is fit for publication.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublicationFitness {
    #[default]
    Fit,
    PartiallyFit,
    Unfit,
}

/// Publication metadata of a dataset, updated by post-processing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Dataset {
    pub dataset_id: String,
    pub name: String,
    #[serde(default)]
    pub publication_fitness: PublicationFitness,
    #[serde(default)]
    pub total_published_records: Option<u64>,
    #[serde(default)]
    pub last_published_date: Option<DateTime<Utc>>,
    /// Record id -> depublication time
    #[serde(default)]
    pub depublished_records: BTreeMap<String, DateTime<Utc>>,
}

impl Dataset {
    pub fn new(dataset_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            name: name.into(),
            publication_fitness: PublicationFitness::Fit,
            total_published_records: None,
            last_published_date: None,
            depublished_records: BTreeMap::new(),
        }
    }
}

/// How often a scheduled workflow fires.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleFrequency {
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl ScheduleFrequency {
    /// The due instant following `pointer`, or `None` for one-off schedules.
    pub fn next_after(&self, pointer: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once => None,
            Self::Daily => Some(pointer + Duration::days(1)),
            Self::Weekly => Some(pointer + Duration::weeks(1)),
            Self::Monthly => pointer.checked_add_months(Months::new(1)),
        }
    }
}

/// A recurring or one-off trigger for a workflow on a dataset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScheduledWorkflow {
    pub dataset_id: String,
    pub workflow_id: String,
    pub frequency: ScheduleFrequency,
    /// Next due instant
    pub pointer_date: DateTime<Utc>,
    #[serde(default)]
    pub priority: u8,
}

impl ScheduledWorkflow {
    pub fn new(
        dataset_id: impl Into<String>,
        workflow_id: impl Into<String>,
        frequency: ScheduleFrequency,
        pointer_date: DateTime<Utc>,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            workflow_id: workflow_id.into(),
            frequency,
            pointer_date,
            priority: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.pointer_date <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn plugin(plugin_type: PluginType, status: ExecutionStatus) -> PluginExecution {
        let mut p = PluginExecution::new(PluginMetadata::new(plugin_type), PluginInput::Nothing);
        p.status = status;
        p
    }

    #[test]
    fn test_plugin_type_round_trip_names() {
        for t in PluginType::ALL {
            assert_eq!(t.as_str().parse::<PluginType>().unwrap(), t);
        }
        assert_eq!("media-process".parse::<PluginType>().unwrap(), PluginType::MediaProcess);
        assert!("unknown".parse::<PluginType>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Finished.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_workflow_yaml_parsing() {
        let yaml = r#"
workflow_id: ingest
plugins:
  - plugin_type: HTTP_HARVEST
    url: https://example.org/data.zip
  - plugin_type: VALIDATION_EXTERNAL
  - plugin_type: LINK_CHECKING
    enabled: false
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.workflow_id, "ingest");
        assert_eq!(workflow.plugins.len(), 3);
        assert_eq!(workflow.enabled_plugins().len(), 2);
        assert_eq!(
            workflow.plugins[0].url.as_deref(),
            Some("https://example.org/data.zip")
        );
    }

    #[test]
    fn test_current_plugin_index() {
        let execution = WorkflowExecution::new(
            "1",
            "wf",
            0,
            vec![
                plugin(PluginType::ValidationExternal, ExecutionStatus::Finished),
                plugin(PluginType::Transformation, ExecutionStatus::Running),
                plugin(PluginType::ValidationInternal, ExecutionStatus::Queued),
            ],
        );
        assert_eq!(execution.current_plugin_index(), Some(1));
        assert_eq!(
            execution.running_plugin().map(|p| p.plugin_type),
            Some(PluginType::Transformation)
        );
    }

    #[test]
    fn test_heartbeat_prefers_running_plugin() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();

        let mut running = plugin(PluginType::Enrichment, ExecutionStatus::Running);
        running.updated_date = Some(later);
        let mut execution = WorkflowExecution::new("1", "wf", 0, vec![running]);
        execution.updated_date = Some(earlier);

        assert_eq!(execution.heartbeat(), Some(later));

        execution.plugins[0].status = ExecutionStatus::Finished;
        assert_eq!(execution.heartbeat(), Some(earlier));
    }

    #[test]
    fn test_cancel_all_keeps_terminal_plugins() {
        let mut execution = WorkflowExecution::new(
            "1",
            "wf",
            0,
            vec![
                plugin(PluginType::ValidationExternal, ExecutionStatus::Finished),
                plugin(PluginType::Transformation, ExecutionStatus::Running),
                plugin(PluginType::ValidationInternal, ExecutionStatus::Queued),
            ],
        );
        execution.owner = Some("node-a".into());
        execution.cancel_all(Utc::now());

        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.plugins[0].status, ExecutionStatus::Finished);
        assert_eq!(execution.plugins[1].status, ExecutionStatus::Cancelled);
        assert_eq!(execution.plugins[2].status, ExecutionStatus::Cancelled);
        assert!(execution.owner.is_none());
    }

    #[test]
    fn test_failure_point() {
        let mut failed = plugin(PluginType::Enrichment, ExecutionStatus::Failed);
        let at = Utc::now();
        failed.updated_date = Some(at);
        let execution = WorkflowExecution::new(
            "1",
            "wf",
            0,
            vec![
                plugin(PluginType::Normalization, ExecutionStatus::Finished),
                failed,
            ],
        );
        assert_eq!(
            execution.failure_point(),
            Some((PluginType::Enrichment, Some(at)))
        );
    }

    #[test]
    fn test_schedule_frequency_advance() {
        let pointer = Utc.with_ymd_and_hms(2024, 1, 31, 8, 30, 0).unwrap();
        assert_eq!(ScheduleFrequency::Once.next_after(pointer), None);
        assert_eq!(
            ScheduleFrequency::Daily.next_after(pointer),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 0).unwrap())
        );
        assert_eq!(
            ScheduleFrequency::Weekly.next_after(pointer),
            Some(Utc.with_ymd_and_hms(2024, 2, 7, 8, 30, 0).unwrap())
        );
        // Month ends clamp to the last day of the next month
        assert_eq!(
            ScheduleFrequency::Monthly.next_after(pointer),
            Some(Utc.with_ymd_and_hms(2024, 2, 29, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_progress_successful_records() {
        let ok = ExecutionProgress {
            processed_records: 10,
            error_records: 2,
        };
        let bad = ExecutionProgress {
            processed_records: 3,
            error_records: 3,
        };
        assert!(ok.has_successful_records());
        assert!(!bad.has_successful_records());
    }
}
