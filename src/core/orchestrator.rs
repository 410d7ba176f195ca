//! Orchestrator facade: the logical operations consumed by the HTTP layer
//! and the CLI.
//!
//! Holds the workspace manager, the run registry, and the shared step
//! runner. Run status falls back to the workspace's durable terminal record
//! when the in-memory run is gone (e.g., after an orchestrator restart);
//! live re-streaming across restarts is deliberately unsupported.

use std::sync::Arc;

use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument};

use crate::config::Config;
use crate::core::broker::LogStream;
use crate::core::registry::RunRegistry;
use crate::core::runner::{ProcessRunner, StepRunner};
use crate::core::supervisor::{RunSupervisor, SupervisorError};
use crate::domain::{Phase, PhaseReport, PipelinePlan, RunId, RunStatus, TerminalRecord};
use crate::workspace::{Workspace, WorkspaceError, WorkspaceManager};

/// Errors surfaced to the orchestrator's callers
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown run {0}")]
    NotFound(RunId),

    #[error("no curated artifact `{name}` for run {run_id}")]
    ArtifactNotFound { run_id: RunId, name: String },

    #[error("corrupt terminal record: {0}")]
    Record(#[from] serde_json::Error),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Run(#[from] SupervisorError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Entry point for creating, driving, observing, and querying runs
pub struct Orchestrator {
    workspaces: WorkspaceManager,
    registry: RunRegistry,
    plan: Arc<PipelinePlan>,
    runner: Arc<dyn StepRunner>,
}

impl Orchestrator {
    pub fn new(config: &Config, plan: PipelinePlan) -> Self {
        Self::with_runner(config, plan, Arc::new(ProcessRunner::new()))
    }

    /// Construct with a custom step runner (test seam)
    pub fn with_runner(config: &Config, plan: PipelinePlan, runner: Arc<dyn StepRunner>) -> Self {
        Self {
            workspaces: WorkspaceManager::new(config.runs_root()),
            registry: RunRegistry::new(),
            plan: Arc::new(plan),
            runner,
        }
    }

    /// Create a run: workspace plus supervisor, atomically.
    ///
    /// Either the whole workspace layout exists afterwards or nothing does.
    #[instrument(skip(self))]
    pub async fn create_run(&self) -> Result<RunId, OrchestratorError> {
        let workspace = self.workspaces.create().await?;
        let run_id = workspace.run_id().clone();

        let supervisor = Arc::new(RunSupervisor::new(
            workspace,
            Arc::clone(&self.plan),
            Arc::clone(&self.runner),
        ));
        self.registry.insert(supervisor);

        info!(%run_id, "run created");
        Ok(run_id)
    }

    /// Run a one-shot batch phase synchronously
    pub async fn run_batch_phase(
        &self,
        run_id: &RunId,
        phase: Phase,
        args: &[String],
    ) -> Result<PhaseReport, OrchestratorError> {
        Ok(self.supervisor(run_id)?.run_batch(phase, args).await?)
    }

    /// Launch the streaming phase; returns once the child is started
    pub async fn start_streaming_phase(
        &self,
        run_id: &RunId,
        args: &[String],
    ) -> Result<(), OrchestratorError> {
        self.supervisor(run_id)?.start_streaming(args).await?;
        Ok(())
    }

    /// Attach a fresh live view of the run's event stream
    pub fn attach_stream(&self, run_id: &RunId) -> Result<LogStream, OrchestratorError> {
        Ok(self.supervisor(run_id)?.attach())
    }

    /// Snapshot of a run's state.
    ///
    /// Prefers the live supervisor; falls back to the workspace's durable
    /// terminal record, and reports `created` for a bare workspace with no
    /// recorded activity.
    pub async fn run_status(&self, run_id: &RunId) -> Result<RunStatus, OrchestratorError> {
        if let Some(supervisor) = self.registry.get(run_id) {
            return Ok(supervisor.status());
        }

        let workspace = self.resolve_workspace(run_id).await?;
        match fs::read(workspace.status_path()).await {
            Ok(bytes) => {
                let record: TerminalRecord = serde_json::from_slice(&bytes)?;
                Ok(record.into_status(run_id.clone()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(RunStatus::created(run_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a named file from the run's curated area
    pub async fn read_curated_artifact(
        &self,
        run_id: &RunId,
        name: &str,
    ) -> Result<Vec<u8>, OrchestratorError> {
        let workspace = match self.registry.get(run_id) {
            Some(supervisor) => supervisor.workspace().clone(),
            None => self.resolve_workspace(run_id).await?,
        };

        let path = workspace.curated_artifact(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OrchestratorError::ArtifactNotFound {
                    run_id: run_id.clone(),
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// First lines of a curated artifact, for cheap previews
    pub async fn artifact_preview(
        &self,
        run_id: &RunId,
        name: &str,
        max_lines: usize,
    ) -> Result<Vec<String>, OrchestratorError> {
        let bytes = self.read_curated_artifact(run_id, name).await?;
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .take(max_lines)
            .map(str::to_string)
            .collect())
    }

    /// Forcibly terminate a run's active child; returns false when idle
    pub fn terminate_run(&self, run_id: &RunId) -> Result<bool, OrchestratorError> {
        Ok(self.supervisor(run_id)?.terminate())
    }

    /// Run ids with a workspace on disk, including terminal runs from
    /// previous orchestrator processes
    pub async fn stored_runs(&self) -> Result<Vec<RunId>, OrchestratorError> {
        Ok(self.workspaces.list().await?)
    }

    fn supervisor(&self, run_id: &RunId) -> Result<Arc<RunSupervisor>, OrchestratorError> {
        self.registry
            .get(run_id)
            .ok_or_else(|| OrchestratorError::NotFound(run_id.clone()))
    }

    async fn resolve_workspace(&self, run_id: &RunId) -> Result<Workspace, OrchestratorError> {
        match self.workspaces.resolve(run_id).await {
            Ok(workspace) => Ok(workspace),
            Err(WorkspaceError::NotFound(_)) => Err(OrchestratorError::NotFound(run_id.clone())),
            Err(err) => Err(err.into()),
        }
    }
}
