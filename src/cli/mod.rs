//! Command-line interface for the orchestrator.
//!
//! Provides commands for running the full pipeline end-to-end with live
//! log output, inspecting run status, and reading curated artifacts.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::core::Orchestrator;
use crate::domain::{Phase, PipelinePlan, RunId};

/// stagehand - run orchestrator and live log streamer
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Pipeline plan file (overrides the config file's plan)
    #[arg(long, env = "STAGEHAND_PLAN")]
    pub plan: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a run and drive it through all phases, streaming logs
    Run {
        /// Extra arguments for the first staging step
        #[arg(long = "staging-arg", value_name = "ARG")]
        staging_args: Vec<String>,

        /// Extra arguments for the streaming step
        #[arg(long = "streaming-arg", value_name = "ARG")]
        streaming_args: Vec<String>,
    },

    /// Show the recorded status of a run
    Status {
        /// Run identifier
        run_id: String,
    },

    /// Print a curated artifact of a run
    Artifact {
        /// Run identifier
        run_id: String,

        /// Artifact file name under the curated area
        name: String,

        /// Only print the first N lines
        #[arg(short, long)]
        lines: Option<usize>,
    },

    /// List runs with a workspace on disk
    Runs,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;

        match self.command {
            Commands::Run {
                staging_args,
                streaming_args,
            } => {
                let plan_path = self
                    .plan
                    .clone()
                    .or_else(|| config.plan_path.clone())
                    .context("No pipeline plan configured; pass --plan or set one in the config file")?;
                let plan = PipelinePlan::from_file(&plan_path)?;

                run_pipeline(&config, plan, &staging_args, &streaming_args).await
            }
            Commands::Status { run_id } => show_status(&config, run_id).await,
            Commands::Artifact {
                run_id,
                name,
                lines,
            } => show_artifact(&config, run_id, name, lines).await,
            Commands::Runs => list_runs(&config).await,
            Commands::Config => {
                println!("data root: {}", config.data_root.display());
                match &config.plan_path {
                    Some(plan) => println!("plan:      {}", plan.display()),
                    None => println!("plan:      (none configured)"),
                }
                Ok(())
            }
        }
    }
}

/// Placeholder plan so status/artifact commands can build an orchestrator
/// without a plan file; they never launch a step.
fn inert_plan() -> PipelinePlan {
    let noop = crate::domain::StepSpec {
        program: "true".to_string(),
        args: Vec::new(),
        env: Default::default(),
    };
    PipelinePlan {
        name: "inspect".to_string(),
        description: String::new(),
        staging: vec![noop.clone()],
        curating: vec![noop.clone()],
        streaming: noop,
        curated_artifact: "cleaned.csv".to_string(),
    }
}

async fn run_pipeline(
    config: &Config,
    plan: PipelinePlan,
    staging_args: &[String],
    streaming_args: &[String],
) -> Result<()> {
    let orchestrator = Orchestrator::new(config, plan);

    let run_id = orchestrator.create_run().await?;
    println!("run {}", run_id);

    for phase in [Phase::Staging, Phase::Curating] {
        let args: &[String] = if phase == Phase::Staging {
            staging_args
        } else {
            &[]
        };
        let report = orchestrator.run_batch_phase(&run_id, phase, args).await?;

        if report.exit_code != Some(0) {
            eprintln!("--- stdout tail ---\n{}", report.stdout_tail);
            eprintln!("--- stderr tail ---\n{}", report.stderr_tail);
            anyhow::bail!(
                "{} phase failed with exit code {:?}",
                phase,
                report.exit_code
            );
        }
        println!("{} done ({} ms)", phase, report.duration_ms);
    }

    // Attach before launch so no output is missed
    let mut stream = orchestrator.attach_stream(&run_id)?;
    orchestrator
        .start_streaming_phase(&run_id, streaming_args)
        .await?;

    while let Some(event) = stream.next().await {
        println!("[{}] {}", event.kind, event.payload);
    }

    let status = orchestrator.run_status(&run_id).await?;
    println!("run {} finished: {}", run_id, status.state);

    if status.state != crate::domain::RunState::Succeeded {
        anyhow::bail!(
            "pipeline did not succeed: {}",
            status.error.unwrap_or_else(|| status.state.to_string())
        );
    }

    Ok(())
}

async fn show_status(config: &Config, run_id: String) -> Result<()> {
    let orchestrator = Orchestrator::new(config, inert_plan());
    let status = orchestrator.run_status(&RunId::from(run_id)).await?;

    println!("run:      {}", status.run_id);
    println!("state:    {}", status.state);
    match status.phase {
        Some(phase) => println!("phase:    {}", phase),
        None => println!("phase:    (none)"),
    }
    if let Some(code) = status.exit_code {
        println!("exit:     {}", code);
    }
    if let Some(error) = &status.error {
        println!("error:    {}", error);
    }
    if !status.tail.is_empty() {
        println!("--- recent output ---");
        for line in &status.tail {
            println!("{}", line);
        }
    }

    Ok(())
}

async fn show_artifact(
    config: &Config,
    run_id: String,
    name: String,
    lines: Option<usize>,
) -> Result<()> {
    let orchestrator = Orchestrator::new(config, inert_plan());
    let run_id = RunId::from(run_id);

    match lines {
        Some(n) => {
            for line in orchestrator.artifact_preview(&run_id, &name, n).await? {
                println!("{}", line);
            }
        }
        None => {
            let bytes = orchestrator.read_curated_artifact(&run_id, &name).await?;
            print!("{}", String::from_utf8_lossy(&bytes));
        }
    }

    Ok(())
}

async fn list_runs(config: &Config) -> Result<()> {
    let orchestrator = Orchestrator::new(config, inert_plan());

    let mut ids = orchestrator.stored_runs().await?;
    ids.sort();

    if ids.is_empty() {
        println!("no runs");
        return Ok(());
    }

    for id in ids {
        match orchestrator.run_status(&id).await {
            Ok(status) => println!("{}  {}", id, status.state),
            Err(e) => println!("{}  (unreadable: {})", id, e),
        }
    }

    Ok(())
}
