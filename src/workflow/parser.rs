//! Workflow Parser
//!
//! Loads workflow definitions from YAML files. Parsing only checks the
//! shape of the document; ordering and history rules are applied by the
//! validator when the workflow is started on a dataset.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workflow_id: ingest-maps
//! plugins:
//!   - plugin_type: HTTP_HARVEST
//!     url: https://example.org/maps.zip
//!   - plugin_type: VALIDATION_EXTERNAL
//!   - plugin_type: TRANSFORMATION
//!   - plugin_type: LINK_CHECKING
//!     enabled: false
//! ```

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Workflow;
use crate::error::{OrchestratorError, Result};

/// Loads a workflow from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the workflow YAML file
///
/// # Returns
///
/// * `Ok(Workflow)` - Parsed workflow with at least one plugin
/// * `Err(OrchestratorError::BadContent)` - Unreadable or malformed file
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        OrchestratorError::BadContent(format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_workflow(&yaml_content)
}

/// Parses a workflow from a YAML document.
pub fn parse_workflow(yaml_content: &str) -> Result<Workflow> {
    let mut workflow: Workflow = serde_yaml::from_str(yaml_content).map_err(|e| {
        OrchestratorError::BadContent(format!(
            "Failed to parse workflow YAML: {}. Check the file format.",
            e
        ))
    })?;

    workflow.workflow_id = workflow.workflow_id.trim().to_string();
    if workflow.workflow_id.is_empty() {
        return Err(OrchestratorError::BadContent(
            "workflow_id must not be empty".to_string(),
        ));
    }
    if workflow.is_empty() {
        return Err(OrchestratorError::BadContent(format!(
            "workflow {} has no plugins",
            workflow.workflow_id
        )));
    }

    info!(
        "Parsed workflow {}: {} plugins ({} enabled)",
        workflow.workflow_id,
        workflow.plugins.len(),
        workflow.enabled_plugins().len()
    );
    Ok(workflow)
}
