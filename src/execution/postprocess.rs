//! Post-Processor
//!
//! Plugin-type specific side effects applied to the dataset after a plugin
//! finished successfully.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;

use crate::error::{OrchestratorError, Result};
use crate::persistence::{DatasetRepository, ExecutionRepository, Repository};
use crate::workflow::model::{
    Dataset, PluginExecution, PluginType, PublicationFitness, WorkflowExecution,
};
use crate::workflow::rules::PostProcessAction;

pub struct PostProcessor {
    repository: Arc<dyn Repository>,
}

impl PostProcessor {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Applies the side effect of the finished plugin at `index`.
    pub async fn apply(&self, execution: &mut WorkflowExecution, index: usize) -> Result<()> {
        let plugin = execution.plugins[index].clone();
        match plugin.plugin_type.rule().post_process {
            PostProcessAction::None => Ok(()),
            PostProcessAction::Publish => self.after_publish(execution, &plugin).await,
            PostProcessAction::Depublish if plugin.metadata.dataset_depublish => {
                self.after_dataset_depublish(execution).await
            }
            PostProcessAction::Depublish => self.after_record_depublish(execution, &plugin).await,
        }
    }

    async fn after_publish(&self, execution: &WorkflowExecution, plugin: &PluginExecution) -> Result<()> {
        let mut dataset = self.dataset(&execution.dataset_id).await?;
        let published = plugin
            .progress
            .processed_records
            .saturating_sub(plugin.progress.error_records);

        dataset.total_published_records = Some(published);
        dataset.last_published_date = Some(finished_at(plugin));
        dataset.publication_fitness = PublicationFitness::Fit;
        dataset.depublished_records.clear();

        info!(
            "Dataset {} published with {} records",
            dataset.dataset_id, published
        );
        self.repository.save_dataset(dataset).await
    }

    async fn after_dataset_depublish(&self, execution: &mut WorkflowExecution) -> Result<()> {
        let mut dataset = self.dataset(&execution.dataset_id).await?;

        if let Some(published) = self
            .repository
            .latest_finished_plugin(&execution.dataset_id, &[PluginType::Publish])
            .await?
        {
            if published.execution_id == execution.id {
                // Published earlier in this run; the local copy is written back last
                if let Some(plugin) = execution.plugin_with_type_mut(PluginType::Publish) {
                    plugin.data_deleted = true;
                }
            } else {
                self.repository
                    .mark_plugin_data_deleted(published.execution_id, PluginType::Publish)
                    .await?;
            }
        }

        dataset.publication_fitness = PublicationFitness::Unfit;
        info!("Dataset {} depublished", dataset.dataset_id);
        self.repository.save_dataset(dataset).await
    }

    async fn after_record_depublish(
        &self,
        execution: &WorkflowExecution,
        plugin: &PluginExecution,
    ) -> Result<()> {
        let mut dataset = self.dataset(&execution.dataset_id).await?;
        let at = finished_at(plugin);

        for record_id in &plugin.metadata.record_ids {
            dataset.depublished_records.insert(record_id.clone(), at);
        }
        if dataset.publication_fitness != PublicationFitness::Unfit {
            dataset.publication_fitness = PublicationFitness::PartiallyFit;
        }

        info!(
            "Dataset {}: {} records depublished",
            dataset.dataset_id,
            plugin.metadata.record_ids.len()
        );
        self.repository.save_dataset(dataset).await
    }

    async fn dataset(&self, dataset_id: &str) -> Result<Dataset> {
        self.repository
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| OrchestratorError::NoDatasetFound(dataset_id.to_string()))
    }
}

fn finished_at(plugin: &PluginExecution) -> DateTime<Utc> {
    plugin.finished_date.unwrap_or_else(Utc::now)
}
