//! Capsul's command line interface.
//!
//! ## Configuration
//! This program retrieves its settings from multiple sources in sequence:
//! default settings, then a configuration file, then environment
//! variables, then CLI flags. Settings from later sources supersede
//! identical settings from earlier ones.
//!
//! Capsul looks for a configuration file at `/etc/capsul/config.toml` or
//! `./capsul.toml`. Environment variables use the `CAPSUL_` prefix, with
//! `__` separating nesting levels.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::conf::engine::EngineConfig;
use crate::conf::Configuration;
use crate::engine::{Engine, LocalExecutor};

#[derive(Debug, Parser)]
#[command(name = "capsul", version, about = "Run Capsul pipelines against an execution engine")]
struct Cli {
    /// Path to a configuration file, overriding the default search paths.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Which configured engine block to use.
    #[arg(long, global = true, default_value = "default")]
    engine: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compiles a pipeline definition, submits it to the engine, and runs
    /// it to completion in this process.
    Run {
        /// Path to a JSON pipeline definition file (spec.md §6).
        pipeline: PathBuf,
    },
    /// Prints the status of a previously submitted execution.
    Status {
        execution_id: String,
    },
    /// Blocks until an execution reaches a terminal status.
    Wait {
        execution_id: String,
        #[arg(long, default_value = "3600")]
        timeout_seconds: u64,
    },
    /// Cancels a still-running execution (spec.md §5 Cancellation).
    Stop {
        execution_id: String,
        /// Also cancel jobs already claimed by a worker, not just those
        /// still ready.
        #[arg(long)]
        kill_running: bool,
    },
}

pub async fn init() {
    human_panic::setup_panic!();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    if let Err(e) = run().await {
        eprintln!("capsul: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config: EngineConfig = Configuration::load(cli.config.clone()).context("loading configuration")?;
    let engine = Engine::new(&config, &cli.engine).await.context("initializing engine")?;

    match cli.command {
        Command::Run { pipeline } => {
            let text = std::fs::read_to_string(&pipeline)
                .with_context(|| format!("reading pipeline definition at {}", pipeline.display()))?;
            let def = capsul_sdk::definition::PipelineDef::from_json(&text)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("parsing pipeline definition")?;
            let (built_pipeline, boundary) = capsul_sdk::definition::build_pipeline(&def)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("building pipeline from definition")?;
            let id = engine.submit(&built_pipeline, &boundary).await?;
            info!("submitted execution {id}");

            let executor = LocalExecutor { database: &engine.database };
            executor.run_to_completion(&id).await?;
            println!("{id}");
        }
        Command::Status { execution_id } => {
            let status = engine.status(&execution_id).await?;
            println!("{status}");
        }
        Command::Wait { execution_id, timeout_seconds } => {
            let status = engine.wait(&execution_id, Duration::from_secs(timeout_seconds)).await?;
            println!("{status}");
        }
        Command::Stop { execution_id, kill_running } => {
            engine.stop(&execution_id, kill_running).await?;
            info!("stopped execution {execution_id}");
        }
    }

    Ok(())
}
