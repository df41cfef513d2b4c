//! BioFlow CLI tool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bioflow_core::{RunStatus, StepState, Workflow};
use bioflow_engine::{Engine, ExecuteOptions};

#[derive(Parser)]
#[command(name = "bioflow")]
#[command(about = "BioFlow workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow
    Run {
        /// Path to the workflow definition (JSON)
        workflow: PathBuf,
        /// Working directory for the run
        #[arg(long, default_value = "bioflow-work")]
        working_dir: PathBuf,
        /// Temp directory (defaults to <working-dir>/temp)
        #[arg(long)]
        temp_dir: Option<PathBuf>,
        /// Runtime parameter, repeatable
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Validate a workflow and print its execution layers
    Plan {
        /// Path to the workflow definition (JSON)
        workflow: PathBuf,
        /// Working directory the plan resolves ${working_dir} against
        #[arg(long, default_value = "bioflow-work")]
        working_dir: PathBuf,
        /// Runtime parameter, repeatable
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            workflow,
            working_dir,
            temp_dir,
            params,
        } => run(&workflow, working_dir, temp_dir, &params).await,
        Commands::Plan {
            workflow,
            working_dir,
            params,
        } => plan(&workflow, &working_dir, &params),
    }
}

async fn run(
    workflow_path: &Path,
    working_dir: PathBuf,
    temp_dir: Option<PathBuf>,
    params: &[String],
) -> Result<()> {
    let workflow = load_workflow(workflow_path)?;
    let parameters = parse_params(params)?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, cancelling run");
            signal_token.cancel();
        }
    });

    let mut options = ExecuteOptions::new(working_dir).cancel_token(cancel);
    if let Some(temp_dir) = temp_dir {
        options = options.temp_dir(temp_dir);
    }
    for (key, value) in parameters {
        options = options.parameter(key, value);
    }

    let engine = Engine::new();
    let result = engine.execute(&workflow, options).await;

    println!("Workflow: {} v{}", result.workflow.name, result.workflow.version);
    let mut names: Vec<&String> = result.step_states.keys().collect();
    names.sort();
    for name in names {
        println!("  {}", describe(&result.step_states[name]));
    }

    match result.status {
        RunStatus::Completed => {
            println!("Result: completed");
            Ok(())
        }
        _ => {
            println!(
                "Result: failed ({})",
                result.error_message.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
    }
}

fn plan(workflow_path: &Path, working_dir: &Path, params: &[String]) -> Result<()> {
    let workflow = load_workflow(workflow_path)?;
    let parameters = parse_params(params)?;

    let engine = Engine::new();
    let plan = engine
        .plan(
            &workflow,
            &parameters,
            working_dir,
            &working_dir.join("temp"),
        )
        .with_context(|| format!("workflow '{}' failed pre-flight", workflow.name))?;

    println!("Workflow: {} v{}", plan.workflow.name, plan.workflow.version);
    for (index, layer) in plan.layers.iter().enumerate() {
        println!("  layer {}: {}", index + 1, layer.join(", "));
    }
    Ok(())
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse workflow file: {}", path.display()))
}

/// Parse repeated `--param KEY=VALUE` flags. Values that parse as JSON
/// keep their type; everything else is a string.
fn parse_params(params: &[String]) -> Result<HashMap<String, serde_json::Value>> {
    let mut map = HashMap::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("invalid parameter '{param}', expected KEY=VALUE"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn describe(state: &StepState) -> String {
    let mut line = format!("{}: {:?}", state.step_name, state.status);
    if let Some(exit_code) = state.exit_code {
        line.push_str(&format!(" (exit {exit_code})"));
    }
    if let (Some(start), Some(end)) = (state.start_time, state.end_time) {
        let duration = (end - start).num_milliseconds() as f64 / 1000.0;
        line.push_str(&format!(" [{duration:.1}s]"));
    }
    if let Some(message) = &state.error_message {
        line.push_str(&format!(" - {message}"));
    }
    line
}
