// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Flowrun CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use flowrun_core::workflow::Workflow;
use flowrun_core::{RunnerOptions, WorkflowDag, WorkflowRunner};
use flowrun_state::{FileStateStore, StateStore, StateStoreRef};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flowrun")]
#[command(version, about = "Workflow execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition
    Validate {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Run a workflow
    Run {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,

        /// Seed variables as key=value pairs (value may be JSON)
        #[arg(short = 'D', long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Seed variables as a JSON object string or file
        #[arg(short, long)]
        input: Option<String>,

        /// Maximum concurrent steps per group
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Whole-workflow deadline in milliseconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Keep running after step failures
        #[arg(long)]
        continue_on_error: bool,

        /// Disable parallel execution
        #[arg(long)]
        no_parallel: bool,

        /// Collect and print execution metrics
        #[arg(long)]
        metrics: bool,

        /// Persist snapshots under this directory
        #[arg(long, value_name = "DIR")]
        state_dir: Option<PathBuf>,

        /// Checkpoint after every N completed steps
        #[arg(long, default_value = "1")]
        checkpoint_interval: u64,
    },

    /// Resume an interrupted workflow from its snapshot
    Resume {
        /// Workflow execution id
        #[arg(value_name = "WORKFLOW_ID")]
        workflow_id: String,

        /// Snapshot directory
        #[arg(long, value_name = "DIR", default_value = ".flowrun/state")]
        state_dir: PathBuf,
    },

    /// List workflow definitions in a directory
    List {
        /// Directory to scan
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,
    },

    /// Show the persisted status of a workflow
    Status {
        /// Workflow execution id
        #[arg(value_name = "WORKFLOW_ID")]
        workflow_id: String,

        /// Snapshot directory
        #[arg(long, value_name = "DIR", default_value = ".flowrun/state")]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("flowrun={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run {
            file,
            vars,
            input,
            max_concurrency,
            timeout,
            continue_on_error,
            no_parallel,
            metrics,
            state_dir,
            checkpoint_interval,
        } => {
            run_workflow(RunArgs {
                file,
                vars,
                input,
                max_concurrency,
                timeout,
                continue_on_error,
                no_parallel,
                metrics,
                state_dir,
                checkpoint_interval,
            })
            .await
        }
        Commands::Resume {
            workflow_id,
            state_dir,
        } => resume_workflow(&workflow_id, &state_dir).await,
        Commands::List { path } => list_workflows(&path),
        Commands::Status {
            workflow_id,
            state_dir,
        } => show_status(&workflow_id, &state_dir).await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("{} {e:#}", "Error:".red().bold());
        std::process::exit(1);
    }
}

fn validate_workflow(file_path: &str) -> Result<()> {
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);

    let workflow = load_workflow(file_path)?;

    if let Err(errors) = workflow.validate() {
        for error in &errors {
            eprintln!("  {} {}", "✗".red(), error);
        }
        anyhow::bail!("{} validation error(s)", errors.len());
    }

    // Resolve the graph to surface cycles.
    let dag = WorkflowDag::from_workflow(&workflow)
        .with_context(|| "failed to build workflow graph")?;
    let order = dag
        .execution_order()
        .with_context(|| "failed to resolve execution order")?;
    let groups = dag.parallel_groups(
        &workflow,
        workflow.parallel_config().default_max_concurrency,
    )?;

    println!("{}", "✓ Workflow is valid".green().bold());
    println!("  Name: {}", workflow.name);
    println!("  Version: {}", workflow.version);
    println!("  Steps: {}", workflow.steps.len());
    println!("  Execution order: {}", order.join(" → "));
    println!("  Parallel groups: {}", groups.len());

    Ok(())
}

struct RunArgs {
    file: String,
    vars: Vec<String>,
    input: Option<String>,
    max_concurrency: Option<usize>,
    timeout: Option<u64>,
    continue_on_error: bool,
    no_parallel: bool,
    metrics: bool,
    state_dir: Option<PathBuf>,
    checkpoint_interval: u64,
}

async fn run_workflow(args: RunArgs) -> Result<()> {
    println!("{} {}", "Running workflow:".cyan().bold(), args.file);

    let workflow = load_workflow(&args.file)?;
    info!(name = %workflow.name, version = %workflow.version, "parsed workflow");

    let mut variables = match &args.input {
        Some(input) => parse_input(input)?,
        None => HashMap::new(),
    };
    for pair in &args.vars {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("variable '{pair}' is not KEY=VALUE"))?;
        // Values that parse as JSON keep their type; everything else is a
        // plain string.
        let value = serde_json::from_str(value).unwrap_or(Value::String(value.to_string()));
        variables.insert(key.to_string(), value);
    }

    let options = RunnerOptions {
        timeout_ms: args.timeout,
        continue_on_error: args.continue_on_error,
        variables,
        parallel_enabled: args.no_parallel.then_some(false),
        max_concurrency: args.max_concurrency,
        enable_metrics: args.metrics,
        checkpoint_interval: args.checkpoint_interval,
        ..Default::default()
    };

    let mut runner = WorkflowRunner::new(options);
    if let Some(state_dir) = &args.state_dir {
        let store: StateStoreRef = Arc::new(
            FileStateStore::new(state_dir)
                .with_context(|| format!("failed to open state dir {}", state_dir.display()))?
                .with_backup(true),
        );
        runner = runner.with_state_store(store);
    }

    let result = runner
        .execute(workflow)
        .await
        .with_context(|| "workflow execution failed")?;

    if result.success {
        println!("{}", "✓ Workflow completed successfully".green().bold());
    } else {
        println!("{}", "✗ Workflow did not complete".red().bold());
    }
    println!();
    print!("{}", runner.generate_summary(&result));

    if args.metrics {
        println!();
        println!("{}", "Detailed report:".cyan().bold());
        println!(
            "{}",
            serde_json::to_string_pretty(&runner.generate_detailed_report(&result))?
        );
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn resume_workflow(workflow_id: &str, state_dir: &Path) -> Result<()> {
    println!("{} {}", "Resuming workflow:".cyan().bold(), workflow_id);

    let store: StateStoreRef = Arc::new(
        FileStateStore::new(state_dir)
            .with_context(|| format!("failed to open state dir {}", state_dir.display()))?
            .with_backup(true),
    );
    let runner = WorkflowRunner::new(RunnerOptions::default()).with_state_store(store);

    let result = runner
        .resume(workflow_id)
        .await
        .with_context(|| "workflow resume failed")?;

    print!("{}", runner.generate_summary(&result));
    if !result.success {
        std::process::exit(1);
    }
    println!("{}", "✓ Workflow completed successfully".green().bold());
    Ok(())
}

fn list_workflows(path: &Path) -> Result<()> {
    println!(
        "{} {}",
        "Workflows in".cyan().bold(),
        path.display()
    );

    let mut found = 0;
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry = entry?;
        let file_path = entry.path();
        let Some(ext) = file_path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !matches!(ext, "yaml" | "yml") {
            continue;
        }
        match Workflow::from_file(&file_path) {
            Ok(workflow) => {
                found += 1;
                println!(
                    "  {} {} v{} ({} steps) - {}",
                    "●".green(),
                    workflow.name.cyan(),
                    workflow.version,
                    workflow.steps.len(),
                    file_path.display().to_string().dimmed()
                );
            }
            Err(e) => {
                println!(
                    "  {} {} - {}",
                    "●".red(),
                    file_path.display(),
                    e.to_string().dimmed()
                );
            }
        }
    }

    if found == 0 {
        println!("  {}", "no workflow files found".dimmed());
    }
    Ok(())
}

async fn show_status(workflow_id: &str, state_dir: &Path) -> Result<()> {
    let store = FileStateStore::new(state_dir)
        .with_context(|| format!("failed to open state dir {}", state_dir.display()))?;

    let snapshot = store
        .load(workflow_id)
        .await
        .with_context(|| "failed to load snapshot")?
        .with_context(|| format!("no snapshot for workflow '{workflow_id}'"))?;

    let completed = snapshot.completed_steps().len();
    let total = snapshot.execution_order.len();

    println!("{} {}", "Workflow:".cyan().bold(), snapshot.workflow_id);
    println!("  Status: {}", snapshot.status);
    println!("  Progress: {completed}/{total} steps completed");
    println!("  Updated: {}", snapshot.updated_at.to_rfc3339());
    for step_id in &snapshot.execution_order {
        if let Some(state) = snapshot.step_states.get(step_id) {
            println!(
                "  {} {:?} ({} attempts)",
                step_id.cyan(),
                state.status,
                state.attempts
            );
        }
    }
    Ok(())
}

fn load_workflow(file_path: &str) -> Result<Workflow> {
    let content = fs::read_to_string(file_path)
        .with_context(|| format!("failed to read workflow file: {file_path}"))?;
    Workflow::from_yaml(&content)
        .with_context(|| format!("failed to parse workflow YAML: {file_path}"))
}

fn parse_input(input: &str) -> Result<HashMap<String, Value>> {
    // File path or inline JSON object.
    if Path::new(input).exists() {
        let content = fs::read_to_string(input)
            .with_context(|| format!("failed to read input file: {input}"))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse input JSON from file: {input}"))
    } else {
        serde_json::from_str(input).with_context(|| "failed to parse input JSON string")
    }
}
