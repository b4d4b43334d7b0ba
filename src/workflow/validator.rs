//! Workflow Validation
//!
//! Checks a workflow definition against the plugin ordering rules before
//! any execution is created:
//! - no empty, duplicate or misplaced plugins
//! - every plugin has a permitted predecessor (in the workflow or in history)
//! - indexing plugins follow validation and transformation
//! - harvest URLs are well formed
//! - depublication stays within its record quota
//!
//! On success it resolves the input of every plugin.

use std::collections::HashSet;

use log::{debug, info};

use super::builder::PredecessorContext;
use super::model::{PluginInput, PluginMetadata, PluginType, Workflow};
use crate::error::{OrchestratorError, Result};

/// Cardinality limits applied during validation.
#[derive(Debug, Clone, Copy)]
pub struct ValidationLimits {
    pub max_depublish_records: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_depublish_records: 1000,
        }
    }
}

/// Validates a workflow and resolves each plugin's input.
///
/// # Arguments
///
/// * `workflow` - The definition to run; disabled plugins are dropped
/// * `context` - Finished plugins from the dataset's history
/// * `enforced_predecessor` - Use the latest output of this type as input
///   of the first plugin instead of searching the permitted predecessors
/// * `limits` - Cardinality limits
///
/// # Returns
///
/// The enabled plugins, normalized, each paired with its input.
pub fn validate_workflow(
    workflow: &Workflow,
    context: &PredecessorContext,
    enforced_predecessor: Option<PluginType>,
    limits: &ValidationLimits,
) -> Result<Vec<(PluginMetadata, PluginInput)>> {
    let plugins: Vec<PluginMetadata> = workflow.enabled_plugins().into_iter().cloned().collect();
    if plugins.is_empty() {
        return Err(OrchestratorError::BadContent(format!(
            "workflow '{}' has no enabled plugins",
            workflow.workflow_id
        )));
    }
    let types: Vec<PluginType> = plugins.iter().map(|p| p.plugin_type).collect();

    check_duplicates(&types)?;
    check_positions(&types)?;

    let mut resolved = Vec::with_capacity(plugins.len());
    for (index, plugin) in plugins.into_iter().enumerate() {
        let plugin = normalize_parameters(plugin, &context.dataset_id, limits)?;
        let input = if index == 0 {
            first_input(&plugin, context, enforced_predecessor)?
        } else {
            subsequent_input(&plugin, &types[..index])?
        };
        check_requirements(plugin.plugin_type, &types[..index], context)?;

        debug!("Resolved {} input: {:?}", plugin.plugin_type, input);
        resolved.push((plugin, input));
    }

    info!(
        "Validated workflow '{}' for dataset {} ({} plugins)",
        workflow.workflow_id,
        context.dataset_id,
        resolved.len()
    );
    Ok(resolved)
}

fn check_duplicates(types: &[PluginType]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut duplicates: Vec<PluginType> = types
        .iter()
        .copied()
        .filter(|t| !seen.insert(*t))
        .collect();
    if duplicates.is_empty() {
        return Ok(());
    }
    duplicates.dedup();
    Err(OrchestratorError::pipeline(
        duplicates,
        "plugin types may appear only once",
    ))
}

fn check_positions(types: &[PluginType]) -> Result<()> {
    if types.len() > 1 && types[0] == PluginType::LinkChecking {
        return Err(OrchestratorError::pipeline(
            vec![PluginType::LinkChecking],
            "link checking cannot start a workflow with further plugins",
        ));
    }
    if let Some(position) = types.iter().position(|t| *t == PluginType::Depublish) {
        if position != types.len() - 1 {
            return Err(OrchestratorError::pipeline(
                vec![PluginType::Depublish],
                "depublication must be the last plugin",
            ));
        }
    }
    if let Some(harvest) = types.iter().skip(1).find(|t| t.is_harvest()) {
        return Err(OrchestratorError::pipeline(
            vec![*harvest],
            "harvesting must be the first plugin",
        ));
    }
    Ok(())
}

fn normalize_parameters(
    mut plugin: PluginMetadata,
    dataset_id: &str,
    limits: &ValidationLimits,
) -> Result<PluginMetadata> {
    if plugin.plugin_type.is_harvest() {
        plugin.url = Some(normalize_harvest_url(&plugin)?);
    }

    if plugin.plugin_type == PluginType::Depublish && !plugin.dataset_depublish {
        let mut ids: Vec<String> = plugin
            .record_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        ids.sort();
        ids.dedup();

        if ids.is_empty() {
            return Err(OrchestratorError::BadContent(
                "record depublication lists no record ids".to_string(),
            ));
        }
        if ids.len() > limits.max_depublish_records {
            return Err(OrchestratorError::QuotaExceeded {
                dataset_id: dataset_id.to_string(),
                requested: ids.len(),
                limit: limits.max_depublish_records,
            });
        }
        plugin.record_ids = ids;
    }

    Ok(plugin)
}

/// Trims a harvest URL, checks its scheme and, for OAI-PMH, strips any
/// query or fragment (the verb and parameters are added per request).
pub fn normalize_harvest_url(plugin: &PluginMetadata) -> Result<String> {
    let raw = plugin.url.as_deref().map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(OrchestratorError::BadContent(format!(
            "{} requires a harvest URL",
            plugin.plugin_type
        )));
    }

    let lower = raw.to_ascii_lowercase();
    let scheme_len = if lower.starts_with("https://") {
        "https://".len()
    } else if lower.starts_with("http://") {
        "http://".len()
    } else {
        return Err(OrchestratorError::BadContent(format!(
            "harvest URL '{}' must use http or https",
            raw
        )));
    };
    if raw.len() == scheme_len || raw.chars().any(char::is_whitespace) {
        return Err(OrchestratorError::BadContent(format!(
            "harvest URL '{}' is not valid",
            raw
        )));
    }

    if plugin.plugin_type == PluginType::OaipmhHarvest {
        let end = raw.find(['?', '#']).unwrap_or(raw.len());
        return Ok(raw[..end].to_string());
    }
    Ok(raw.to_string())
}

fn first_input(
    plugin: &PluginMetadata,
    context: &PredecessorContext,
    enforced_predecessor: Option<PluginType>,
) -> Result<PluginInput> {
    let plugin_type = plugin.plugin_type;
    if plugin_type.is_harvest() {
        return Ok(PluginInput::HarvestSource {
            url: plugin.url.clone().unwrap_or_default(),
        });
    }
    if !plugin_type.needs_record_input() {
        return Ok(PluginInput::Nothing);
    }

    let candidates: Vec<PluginType> = match enforced_predecessor {
        Some(enforced) if plugin_type.accepts_predecessor(enforced) => vec![enforced],
        Some(enforced) => {
            return Err(OrchestratorError::pipeline(
                vec![plugin_type, enforced],
                "enforced predecessor is not permitted",
            ))
        }
        None => plugin_type.rule().predecessors.to_vec(),
    };

    let record = context.latest_of(&candidates).ok_or_else(|| {
        OrchestratorError::pipeline(
            vec![plugin_type],
            "no finished predecessor in the dataset's history",
        )
    })?;
    if !record.plugin.progress.has_successful_records() {
        return Err(OrchestratorError::pipeline(
            vec![plugin_type, record.plugin.plugin_type],
            "latest predecessor produced no successful records",
        ));
    }
    let output = record.plugin.data_output.clone().ok_or_else(|| {
        OrchestratorError::pipeline(
            vec![plugin_type, record.plugin.plugin_type],
            "latest predecessor has no data output",
        )
    })?;

    Ok(PluginInput::History { output })
}

fn subsequent_input(plugin: &PluginMetadata, earlier: &[PluginType]) -> Result<PluginInput> {
    let plugin_type = plugin.plugin_type;
    if !plugin_type.needs_record_input() {
        return Ok(PluginInput::Nothing);
    }
    earlier
        .iter()
        .rev()
        .find(|t| plugin_type.accepts_predecessor(**t))
        .map(|t| PluginInput::Predecessor { plugin_type: *t })
        .ok_or_else(|| {
            OrchestratorError::pipeline(
                vec![plugin_type],
                "no permitted predecessor earlier in the workflow",
            )
        })
}

fn check_requirements(
    plugin_type: PluginType,
    earlier: &[PluginType],
    context: &PredecessorContext,
) -> Result<()> {
    let missing: Vec<PluginType> = plugin_type
        .rule()
        .requires_finished
        .iter()
        .copied()
        .filter(|t| !earlier.contains(t) && !context.has_finished(*t))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut offending = vec![plugin_type];
    offending.extend(missing);
    Err(OrchestratorError::pipeline(
        offending,
        "indexing requires validation and transformation to have finished",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PluginRecord;
    use crate::workflow::model::{
        DataOutputRef, ExecutionProgress, ExecutionStatus, PluginExecution,
    };
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn history_record(plugin_type: PluginType, age_days: i64, processed: u64) -> PluginRecord {
        let finished = Utc::now() - Duration::days(age_days);
        let execution_id = Uuid::new_v4();
        let mut plugin =
            PluginExecution::new(PluginMetadata::new(plugin_type), PluginInput::Nothing);
        plugin.status = ExecutionStatus::Finished;
        plugin.finished_date = Some(finished);
        plugin.progress = ExecutionProgress {
            processed_records: processed,
            error_records: 0,
        };
        plugin.data_output = Some(DataOutputRef {
            execution_id,
            plugin_type,
            finished_date: finished,
            location: format!("store://{}", plugin_type),
        });
        PluginRecord {
            execution_id,
            plugin,
        }
    }

    fn harvested_context() -> PredecessorContext {
        PredecessorContext::empty("1")
            .with_record(history_record(PluginType::HttpHarvest, 3, 10))
            .with_record(history_record(PluginType::ValidationExternal, 2, 10))
            .with_record(history_record(PluginType::Transformation, 1, 10))
    }

    fn validate(workflow: &Workflow, context: &PredecessorContext) -> Result<Vec<(PluginMetadata, PluginInput)>> {
        validate_workflow(workflow, context, None, &ValidationLimits::default())
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let workflow = Workflow::new("wf")
            .with_plugin(PluginMetadata::new(PluginType::Enrichment).enabled(false));
        let err = validate(&workflow, &harvested_context()).unwrap_err();
        assert!(matches!(err, OrchestratorError::BadContent(_)));
    }

    #[test]
    fn test_full_chain_from_history() {
        let workflow = Workflow::new("wf")
            .with_type(PluginType::ValidationInternal)
            .with_type(PluginType::Normalization)
            .with_type(PluginType::Enrichment);
        let resolved = validate(&workflow, &harvested_context()).unwrap();

        assert_eq!(resolved.len(), 3);
        match &resolved[0].1 {
            PluginInput::History { output } => {
                assert_eq!(output.plugin_type, PluginType::Transformation)
            }
            other => panic!("unexpected input {:?}", other),
        }
        assert_eq!(
            resolved[2].1,
            PluginInput::Predecessor {
                plugin_type: PluginType::Normalization
            }
        );
    }

    #[test]
    fn test_missing_history_predecessor() {
        let workflow = Workflow::new("wf").with_type(PluginType::Enrichment);
        let err = validate(&workflow, &harvested_context()).unwrap_err();
        match err {
            OrchestratorError::PipelineValidation { offending, .. } => {
                assert_eq!(offending, vec![PluginType::Enrichment])
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_predecessor_without_successful_records() {
        let context =
            PredecessorContext::empty("1").with_record(history_record(PluginType::Transformation, 1, 0));
        let workflow = Workflow::new("wf").with_type(PluginType::ValidationInternal);
        assert!(matches!(
            validate(&workflow, &context),
            Err(OrchestratorError::PipelineValidation { .. })
        ));
    }

    #[test]
    fn test_gap_in_workflow_rejected() {
        let workflow = Workflow::new("wf")
            .with_type(PluginType::ValidationInternal)
            .with_type(PluginType::Enrichment);
        let err = validate(&workflow, &harvested_context()).unwrap_err();
        assert!(err.to_string().contains("ENRICHMENT"));
    }

    #[test]
    fn test_duplicate_types_rejected() {
        let workflow = Workflow::new("wf")
            .with_type(PluginType::ValidationInternal)
            .with_type(PluginType::ValidationInternal);
        let err = validate(&workflow, &harvested_context()).unwrap_err();
        assert!(err.to_string().contains("only once"));
    }

    #[test]
    fn test_link_checking_first_only_when_alone() {
        let alone = Workflow::new("wf").with_type(PluginType::LinkChecking);
        assert!(validate(&alone, &harvested_context()).is_ok());

        let leading = Workflow::new("wf")
            .with_type(PluginType::LinkChecking)
            .with_type(PluginType::ValidationInternal);
        assert!(validate(&leading, &harvested_context()).is_err());
    }

    #[test]
    fn test_depublish_must_be_last() {
        let workflow = Workflow::new("wf")
            .with_plugin(PluginMetadata::new(PluginType::Depublish).depublish_dataset())
            .with_type(PluginType::ValidationInternal);
        let err = validate(&workflow, &harvested_context()).unwrap_err();
        assert!(err.to_string().contains("DEPUBLISH"));
    }

    #[test]
    fn test_depublish_needs_no_history() {
        let workflow = Workflow::new("wf")
            .with_plugin(PluginMetadata::new(PluginType::Depublish).depublish_dataset());
        let resolved = validate(&workflow, &PredecessorContext::empty("1")).unwrap();
        assert_eq!(resolved[0].1, PluginInput::Nothing);
    }

    #[test]
    fn test_record_depublish_quota() {
        let ids: Vec<String> = (0..5).map(|i| format!("record-{}", i)).collect();
        let workflow = Workflow::new("wf")
            .with_plugin(PluginMetadata::new(PluginType::Depublish).with_record_ids(ids));
        let limits = ValidationLimits {
            max_depublish_records: 3,
        };
        let err = validate_workflow(&workflow, &PredecessorContext::empty("1"), None, &limits)
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::QuotaExceeded {
                requested: 5,
                limit: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_record_depublish_requires_ids() {
        let workflow = Workflow::new("wf").with_plugin(
            PluginMetadata::new(PluginType::Depublish).with_record_ids(vec!["  ".into()]),
        );
        let err = validate(&workflow, &PredecessorContext::empty("1")).unwrap_err();
        assert!(matches!(err, OrchestratorError::BadContent(_)));
    }

    #[test]
    fn test_index_requires_validation_and_transformation() {
        // History has media processing but never transformed
        let context = PredecessorContext::empty("1")
            .with_record(history_record(PluginType::HttpHarvest, 5, 10))
            .with_record(history_record(PluginType::ValidationExternal, 4, 10))
            .with_record(history_record(PluginType::MediaProcess, 1, 10));
        let workflow = Workflow::new("wf").with_type(PluginType::Preview);

        let err = validate(&workflow, &context).unwrap_err();
        match err {
            OrchestratorError::PipelineValidation { offending, .. } => {
                assert_eq!(offending, vec![PluginType::Preview, PluginType::Transformation])
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_harvest_url_normalization() {
        let oai = PluginMetadata::new(PluginType::OaipmhHarvest)
            .with_url("  https://oai.example.org/provider?verb=ListRecords#top ");
        assert_eq!(
            normalize_harvest_url(&oai).unwrap(),
            "https://oai.example.org/provider"
        );

        let http = PluginMetadata::new(PluginType::HttpHarvest)
            .with_url("http://example.org/dump.zip?token=1");
        assert_eq!(
            normalize_harvest_url(&http).unwrap(),
            "http://example.org/dump.zip?token=1"
        );

        let ftp = PluginMetadata::new(PluginType::HttpHarvest).with_url("ftp://example.org/x");
        assert!(normalize_harvest_url(&ftp).is_err());

        let missing = PluginMetadata::new(PluginType::HttpHarvest);
        assert!(normalize_harvest_url(&missing).is_err());
    }

    #[test]
    fn test_harvest_must_be_first() {
        let workflow = Workflow::new("wf")
            .with_plugin(PluginMetadata::new(PluginType::HttpHarvest).with_url("https://a.org/x"))
            .with_plugin(PluginMetadata::new(PluginType::OaipmhHarvest).with_url("https://b.org/oai"));
        let err = validate(&workflow, &PredecessorContext::empty("1")).unwrap_err();
        assert!(err.to_string().contains("OAIPMH_HARVEST"));
    }

    #[test]
    fn test_enforced_predecessor() {
        let context = harvested_context()
            .with_record(history_record(PluginType::OaipmhHarvest, 0, 10));
        let workflow = Workflow::new("wf").with_type(PluginType::ValidationExternal);

        let resolved =
            validate_workflow(&workflow, &context, Some(PluginType::HttpHarvest), &ValidationLimits::default())
                .unwrap();
        match &resolved[0].1 {
            PluginInput::History { output } => assert_eq!(output.plugin_type, PluginType::HttpHarvest),
            other => panic!("unexpected input {:?}", other),
        }

        let err = validate_workflow(
            &workflow,
            &context,
            Some(PluginType::Transformation),
            &ValidationLimits::default(),
        )
        .unwrap_err();
        assert!(err.is_validation());
    }
}
