use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mbflow_engine::{Engine, EngineConfig, ExecutionOptions};
use mbflow_executor::ExecutorRegistry;
use mbflow_observer::LogObserver;
use mbflow_store::MemoryRepository;
use mbflow_workflow::{Workflow, analyze};

/// MBFlow - workflow orchestration engine
#[derive(Parser)]
#[command(name = "mbflow")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Validate a workflow file and print its schedule plan
  Validate {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,
  },

  /// Run a workflow to completion and print the output
  Run {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,

    /// Execution input as a JSON object
    #[arg(long, default_value = "{}")]
    input: String,

    /// Fail on unresolved template variables
    #[arg(long)]
    strict: bool,

    /// Worker pool size (0 = serial)
    #[arg(long)]
    max_parallelism: Option<usize>,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();
  match cli.command {
    Commands::Validate { workflow_file } => validate(workflow_file),
    Commands::Run {
      workflow_file,
      input,
      strict,
      max_parallelism,
    } => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run(workflow_file, input, strict, max_parallelism))
    }
  }
}

fn load_workflow(workflow_file: &PathBuf) -> Result<Workflow> {
  let content = std::fs::read_to_string(workflow_file)
    .with_context(|| format!("failed to read workflow file: {}", workflow_file.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse workflow file: {}", workflow_file.display()))
}

fn validate(workflow_file: PathBuf) -> Result<()> {
  let workflow = load_workflow(&workflow_file)?;
  match analyze(&workflow) {
    Ok(plan) => {
      println!("workflow '{}' is valid", workflow.name);
      for (index, wave) in plan.waves.iter().enumerate() {
        println!("  wave {}: {}", index, wave.join(", "));
      }
      Ok(())
    }
    Err(e) => {
      eprintln!("validation failed [{}]: {}", e.code(), e);
      std::process::exit(1);
    }
  }
}

async fn run(
  workflow_file: PathBuf,
  input: String,
  strict: bool,
  max_parallelism: Option<usize>,
) -> Result<()> {
  let workflow = load_workflow(&workflow_file)?;
  let input = serde_json::from_str::<serde_json::Value>(&input)
    .context("--input must be a JSON object")?
    .as_object()
    .cloned()
    .context("--input must be a JSON object")?;

  let engine = Engine::new(
    Arc::new(MemoryRepository::new()),
    ExecutorRegistry::with_builtins(),
    EngineConfig::from_env(),
  );

  let mut options = ExecutionOptions::default()
    .with_strict_mode(strict)
    .with_observer(Arc::new(LogObserver));
  if let Some(n) = max_parallelism {
    options = options.with_max_parallelism(n);
  }

  let execution = engine.execute_sync(&workflow, input, options).await?;

  println!("status: {:?}", execution.status);
  if let Some(error) = &execution.error {
    eprintln!("error: {}", error);
  }
  println!(
    "{}",
    serde_json::to_string_pretty(&serde_json::Value::Object(execution.output))?
  );
  Ok(())
}
