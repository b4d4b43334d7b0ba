//! Metis Orchestrator CLI Entry Point
//!
//! Runs a single orchestrator node with in-process collaborators and a
//! simulated processing service.
//!
//! # Usage
//!
//! ```bash
//! # Run a workflow on a dataset and wait for it to end
//! metis-orchestrator --workflow ingest.yaml --dataset 42
//!
//! # Preview the pipeline without running it
//! metis-orchestrator --workflow ingest.yaml --dry-run
//!
//! # Use a configuration file and stop after two minutes
//! metis-orchestrator --config metis.yaml --workflow ingest.yaml --run-for 120
//! ```

use std::env;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};

use metis_orchestrator::config::OrchestratorConfig;
use metis_orchestrator::runtime::{Collaborators, Node, RunningNode};
use metis_orchestrator::workflow::builder::{PipelineBuilder, PredecessorContext};
use metis_orchestrator::workflow::model::{
    Dataset, ExecutionId, ExecutionStatus, PluginInput, PluginType, Workflow,
};
use metis_orchestrator::workflow::parser::load_workflow;
use metis_orchestrator::workflow::validator::ValidationLimits;
use metis_orchestrator::{APP_NAME, VERSION};

/// Dataset used when none is specified.
const DEFAULT_DATASET: &str = "1";

/// Interval between status checks of the started execution.
const STATUS_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line options parsed from arguments.
#[derive(Debug, Default)]
struct CliOptions {
    config_path: Option<String>,
    workflow_path: Option<String>,
    dataset_id: Option<String>,
    priority: u8,
    enforced_predecessor: Option<PluginType>,
    run_for: Option<Duration>,
    dry_run: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Distributed Workflow Execution Orchestrator");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: metis-orchestrator [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config PATH       Orchestrator configuration YAML");
    println!("  --workflow PATH     Workflow definition YAML to run");
    println!("  --dataset ID        Target dataset (default: {})", DEFAULT_DATASET);
    println!("  --priority N        Dispatch priority (default: 0)");
    println!("  --enforce TYPE      Take the first plugin's input from this plugin type");
    println!("  --run-for SECS      Stop the node after this many seconds");
    println!("  --dry-run           Build and print the pipeline without running it");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Without --workflow the node runs idle until interrupted.");
    println!();
    println!("Examples:");
    println!("  metis-orchestrator --workflow ingest.yaml --dataset 42");
    println!("  metis-orchestrator --workflow ingest.yaml --dry-run");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into CLI options.
fn parse_arguments(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => options.dry_run = true,
            "--verbose" | "-v" => options.verbose = true,
            "--config" => {
                options.config_path = Some(next_value(args, &mut i, "--config")?.to_string());
            }
            "--workflow" => {
                options.workflow_path = Some(next_value(args, &mut i, "--workflow")?.to_string());
            }
            "--dataset" => {
                options.dataset_id = Some(next_value(args, &mut i, "--dataset")?.to_string());
            }
            "--priority" => {
                let value = next_value(args, &mut i, "--priority")?;
                options.priority = value
                    .parse()
                    .map_err(|_| format!("Invalid priority: {}", value))?;
            }
            "--enforce" => {
                let value = next_value(args, &mut i, "--enforce")?;
                options.enforced_predecessor = Some(value.parse()?);
            }
            "--run-for" => {
                let value = next_value(args, &mut i, "--run-for")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid --run-for value: {}", value))?;
                options.run_for = Some(Duration::from_secs(secs));
            }
            arg => return Err(format!("Unknown argument: {}", arg)),
        }
        i += 1;
    }

    if options.dry_run && options.workflow_path.is_none() {
        return Err("--dry-run requires --workflow".to_string());
    }
    Ok(options)
}

/// Prints the plugins a workflow would run on a dataset without history.
fn print_pipeline(
    workflow: &Workflow,
    dataset_id: &str,
    options: &CliOptions,
    config: &OrchestratorConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let builder = PipelineBuilder::new(ValidationLimits {
        max_depublish_records: config.max_depublish_records,
    });
    let execution = builder.build(
        workflow,
        &PredecessorContext::empty(dataset_id),
        options.priority,
        options.enforced_predecessor,
    )?;

    println!("Pipeline for dataset {}:", dataset_id);
    for (index, plugin) in execution.plugins.iter().enumerate() {
        let input = match &plugin.input {
            PluginInput::HarvestSource { url } => format!("harvest {}", url),
            PluginInput::History { output } => format!("history {}", output.plugin_type),
            PluginInput::Predecessor { plugin_type } => format!("after {}", plugin_type),
            PluginInput::Nothing => "no input".to_string(),
        };
        println!("  {}. {} ({})", index + 1, plugin.plugin_type, input);
    }
    Ok(())
}

fn status_label(status: ExecutionStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        ExecutionStatus::Finished => text.green(),
        ExecutionStatus::Failed => text.red(),
        ExecutionStatus::Cancelled => text.yellow(),
        _ => text.normal(),
    }
}

/// Waits until the execution ends or the node is told to stop.
async fn await_execution(
    node: &RunningNode,
    execution_id: ExecutionId,
    run_for: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let wait = async {
        loop {
            let execution = node.orchestrator().get_execution(execution_id).await?;
            if execution.is_terminal() {
                return Ok::<_, metis_orchestrator::OrchestratorError>(execution);
            }
            tokio::time::sleep(STATUS_CHECK_INTERVAL).await;
        }
    };

    let stop = async {
        match run_for {
            Some(limit) => tokio::time::sleep(limit).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for interrupts: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    tokio::select! {
        ended = wait => {
            let execution = ended?;
            println!();
            println!("Execution {}: {}", execution.id, status_label(execution.status));
            for plugin in &execution.plugins {
                println!(
                    "  {:<22} {} {} records{}",
                    plugin.plugin_type.to_string(),
                    status_label(plugin.status),
                    plugin.progress.processed_records,
                    plugin
                        .fail_message
                        .as_deref()
                        .map(|m| format!(" ({})", m))
                        .unwrap_or_default()
                );
            }
        }
        _ = stop => {
            warn!("Stopping before execution {} ended", execution_id);
        }
    }
    Ok(())
}

/// Main application logic.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(options.verbose);
    print_banner();

    let config = match &options.config_path {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };
    info!("Node: {}", config.node_id);

    let dataset_id = options
        .dataset_id
        .clone()
        .unwrap_or_else(|| DEFAULT_DATASET.to_string());
    let workflow = match &options.workflow_path {
        Some(path) => Some(load_workflow(path).map_err(|e| {
            error!("Failed to load workflow: {}", e);
            format!("Could not load workflow from '{}': {}", path, e)
        })?),
        None => None,
    };

    if options.dry_run {
        info!("Mode: DRY RUN (nothing will be dispatched)");
        if let Some(workflow) = &workflow {
            print_pipeline(workflow, &dataset_id, &options, &config)?;
        }
        return Ok(());
    }

    let node = Node::new(config, Collaborators::in_memory());
    node.orchestrator()
        .register_dataset(Dataset::new(dataset_id.clone(), format!("dataset {}", dataset_id)))
        .await?;
    let running = node.start().await?;

    let outcome = match &workflow {
        Some(workflow) => {
            match running
                .orchestrator()
                .start_workflow(&dataset_id, workflow, options.priority, options.enforced_predecessor)
                .await
            {
                Ok(execution) => await_execution(&running, execution.id, options.run_for).await,
                Err(e) => Err(e.into()),
            }
        }
        None => {
            info!("No workflow given, running idle");
            match options.run_for {
                Some(limit) => tokio::time::sleep(limit).await,
                None => tokio::signal::ctrl_c().await?,
            }
            Ok(())
        }
    };

    running.shutdown().await;
    outcome
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
