//! Pipeline Builder
//!
//! Turns a workflow definition into a new queued [`WorkflowExecution`] for
//! one dataset. Building is pure: the dataset's history is loaded up front
//! into a [`PredecessorContext`] and persisting is left to the caller.

use std::collections::HashMap;

use log::info;

use super::model::{PluginExecution, PluginType, Workflow, WorkflowExecution};
use super::validator::{validate_workflow, ValidationLimits};
use crate::error::Result;
use crate::persistence::{ExecutionRepository, PluginRecord, Repository};

/// Latest finished plugin of each type for one dataset.
#[derive(Debug, Clone, Default)]
pub struct PredecessorContext {
    pub dataset_id: String,
    history: HashMap<PluginType, PluginRecord>,
}

impl PredecessorContext {
    /// A dataset that has never been processed.
    pub fn empty(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            history: HashMap::new(),
        }
    }

    /// Adds a finished plugin, keeping the newest one per type.
    pub fn with_record(mut self, record: PluginRecord) -> Self {
        let plugin_type = record.plugin.plugin_type;
        let newer = self
            .history
            .get(&plugin_type)
            .map_or(true, |existing| existing.plugin.finished_date < record.plugin.finished_date);
        if newer {
            self.history.insert(plugin_type, record);
        }
        self
    }

    /// Loads the dataset's history from the repository.
    pub async fn load(repository: &dyn Repository, dataset_id: &str) -> Result<Self> {
        let mut context = Self::empty(dataset_id);
        for plugin_type in PluginType::ALL {
            if let Some(record) = repository
                .latest_finished_plugin(dataset_id, &[plugin_type])
                .await?
            {
                context = context.with_record(record);
            }
        }
        Ok(context)
    }

    /// The most recently finished plugin among `types`.
    pub fn latest_of(&self, types: &[PluginType]) -> Option<&PluginRecord> {
        types
            .iter()
            .filter_map(|t| self.history.get(t))
            .max_by_key(|r| r.plugin.finished_date)
    }

    pub fn has_finished(&self, plugin_type: PluginType) -> bool {
        self.history.contains_key(&plugin_type)
    }
}

/// Builds validated executions.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    limits: ValidationLimits,
}

impl PipelineBuilder {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    /// Validates the workflow and creates a queued execution.
    ///
    /// # Arguments
    ///
    /// * `workflow` - The definition to run
    /// * `context` - History of the target dataset
    /// * `priority` - Dispatch priority
    /// * `enforced_predecessor` - Optional fixed input type for the first plugin
    pub fn build(
        &self,
        workflow: &Workflow,
        context: &PredecessorContext,
        priority: u8,
        enforced_predecessor: Option<PluginType>,
    ) -> Result<WorkflowExecution> {
        let plugins = validate_workflow(workflow, context, enforced_predecessor, &self.limits)?
            .into_iter()
            .map(|(metadata, input)| PluginExecution::new(metadata, input))
            .collect();

        let execution = WorkflowExecution::new(
            context.dataset_id.clone(),
            workflow.workflow_id.clone(),
            priority,
            plugins,
        );
        info!(
            "Built execution {} for dataset {}: {}",
            execution.id,
            execution.dataset_id,
            execution
                .plugins
                .iter()
                .map(|p| p.plugin_type.to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{CreateOutcome, InMemoryRepository};
    use crate::workflow::model::{
        DataOutputRef, ExecutionProgress, ExecutionStatus, PluginInput, PluginMetadata,
    };
    use chrono::{Duration, Utc};

    fn finished_execution(dataset_id: &str, plugin_type: PluginType, age_days: i64) -> WorkflowExecution {
        let finished = Utc::now() - Duration::days(age_days);
        let mut plugin =
            PluginExecution::new(PluginMetadata::new(plugin_type), PluginInput::Nothing);
        plugin.status = ExecutionStatus::Finished;
        plugin.finished_date = Some(finished);
        plugin.progress = ExecutionProgress {
            processed_records: 5,
            error_records: 1,
        };
        let mut execution = WorkflowExecution::new(dataset_id, "wf", 0, vec![]);
        plugin.data_output = Some(DataOutputRef {
            execution_id: execution.id,
            plugin_type,
            finished_date: finished,
            location: "loc".into(),
        });
        execution.plugins.push(plugin);
        execution.status = ExecutionStatus::Finished;
        execution
    }

    #[test]
    fn test_build_harvest_pipeline() {
        let workflow = Workflow::new("ingest")
            .with_plugin(PluginMetadata::new(PluginType::HttpHarvest).with_url(" https://example.org/a.zip "))
            .with_type(PluginType::ValidationExternal)
            .with_type(PluginType::Transformation)
            .with_plugin(PluginMetadata::new(PluginType::LinkChecking).enabled(false));

        let execution = PipelineBuilder::default()
            .build(&workflow, &PredecessorContext::empty("1"), 3, None)
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Queued);
        assert_eq!(execution.priority, 3);
        assert_eq!(execution.workflow_id, "ingest");
        assert_eq!(execution.plugins.len(), 3);
        assert!(execution.plugins.iter().all(|p| p.status == ExecutionStatus::Queued));
        assert_eq!(
            execution.plugins[0].input,
            PluginInput::HarvestSource {
                url: "https://example.org/a.zip".into()
            }
        );
        assert_eq!(
            execution.plugins[1].input,
            PluginInput::Predecessor {
                plugin_type: PluginType::HttpHarvest
            }
        );
    }

    #[test]
    fn test_context_keeps_newest_per_type() {
        let old = finished_execution("1", PluginType::Enrichment, 3);
        let new = finished_execution("1", PluginType::Enrichment, 1);
        let new_id = new.id;
        let record = |e: &WorkflowExecution| PluginRecord {
            execution_id: e.id,
            plugin: e.plugins[0].clone(),
        };

        let context = PredecessorContext::empty("1")
            .with_record(record(&new))
            .with_record(record(&old));
        assert_eq!(
            context.latest_of(&[PluginType::Enrichment]).unwrap().execution_id,
            new_id
        );
    }

    #[tokio::test]
    async fn test_load_context_from_repository() {
        let repo = InMemoryRepository::new();
        for (t, age) in [
            (PluginType::Normalization, 4),
            (PluginType::Enrichment, 2),
            (PluginType::MediaProcess, 1),
        ] {
            let outcome = repo
                .create_if_none_active(finished_execution("7", t, age))
                .await
                .unwrap();
            assert!(matches!(outcome, CreateOutcome::Created(_)));
        }

        let context = PredecessorContext::load(&repo, "7").await.unwrap();
        assert!(context.has_finished(PluginType::Enrichment));
        assert!(!context.has_finished(PluginType::Publish));
        assert_eq!(
            context
                .latest_of(&[PluginType::Normalization, PluginType::Enrichment])
                .unwrap()
                .plugin
                .plugin_type,
            PluginType::Enrichment
        );

        let workflow = Workflow::new("wf").with_type(PluginType::MediaProcess);
        let execution = PipelineBuilder::default()
            .build(&workflow, &context, 0, None)
            .unwrap();
        assert!(matches!(
            execution.plugins[0].input,
            PluginInput::History { .. }
        ));
        assert_eq!(execution.dataset_id, "7");
    }
}
