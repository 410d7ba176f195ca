//! Step descriptions and the pipeline plan.
//!
//! A plan is declared in YAML and names the external commands each phase
//! runs. Commands are structured argument vectors passed directly to the
//! process-launch primitive; no shell is ever involved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::run::Phase;

/// Declared command for one pipeline step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Executable to launch
    pub program: String,

    /// Structured argument vector (never a shell string)
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The commands a pipeline's phases execute, plus the curated artifact
/// the curating phase is declared to produce.
///
/// Supports YAML of the form:
///
/// ```yaml
/// name: sentiment-demo
/// description: Mock sentiment pipeline
/// curated_artifact: cleaned.csv
/// staging:
///   - program: python3
///     args: ["-m", "pipeline.mockgen"]
/// curating:
///   - program: python3
///     args: ["-m", "pipeline.etl"]
/// streaming:
///   program: python3
///   args: ["-m", "pipeline.e2e"]
///   env:
///     PYTHONUNBUFFERED: "1"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelinePlan {
    /// Plan name (used in logs)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// One-shot steps that populate the raw staging area
    pub staging: Vec<StepSpec>,

    /// One-shot steps that produce the curated artifact
    pub curating: Vec<StepSpec>,

    /// The long-running streamed pipeline step
    pub streaming: StepSpec,

    /// File under `curated/` whose existence gates the streaming phase
    #[serde(default = "default_curated_artifact")]
    pub curated_artifact: String,
}

fn default_curated_artifact() -> String {
    "cleaned.csv".to_string()
}

impl PipelinePlan {
    /// Load and validate a plan from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let plan = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))?;

        plan.validate()?;
        Ok(plan)
    }

    /// Parse a plan from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline plan YAML")
    }

    /// Validate the plan definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Plan name cannot be empty");
        }

        for (phase, steps) in [(Phase::Staging, &self.staging), (Phase::Curating, &self.curating)] {
            if steps.is_empty() {
                anyhow::bail!("Phase `{}` must have at least one step", phase);
            }
            for step in steps {
                if step.program.is_empty() {
                    anyhow::bail!("Phase `{}` has a step with an empty program", phase);
                }
            }
        }

        if self.streaming.program.is_empty() {
            anyhow::bail!("Streaming step has an empty program");
        }

        if self.curated_artifact.is_empty() || self.curated_artifact.contains(['/', '\\']) {
            anyhow::bail!(
                "Curated artifact must be a bare file name, got `{}`",
                self.curated_artifact
            );
        }

        Ok(())
    }

    /// Steps for a batch phase; `None` for the streaming phase
    pub fn batch_steps(&self, phase: Phase) -> Option<&[StepSpec]> {
        match phase {
            Phase::Staging => Some(&self.staging),
            Phase::Curating => Some(&self.curating),
            Phase::Streaming => None,
        }
    }
}

/// One concrete external invocation, immutable once constructed.
///
/// The environment overlay always carries the run's workspace root, so the
/// child sees its own workspace and nothing of any other run's.
#[derive(Debug, Clone)]
pub struct Step {
    pub program: String,

    pub args: Vec<String>,

    /// Environment overlay applied on top of the service environment
    pub env: Vec<(String, String)>,

    /// Where to record the child pid for external inspection (streaming only)
    pub pid_file: Option<PathBuf>,
}

impl Step {
    /// Command identity for diagnostics and error context
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Outcome of one step execution.
///
/// A nonzero exit code is a value, not an error: the supervisor decides
/// whether it is fatal to the run.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    /// Exit code; `None` when the child was killed by a signal
    pub exit_code: Option<i32>,

    /// Whether the cancellation signal fired before the child exited
    pub cancelled: bool,

    /// Trailing portion of standard output, for diagnostics
    pub stdout_tail: String,

    /// Trailing portion of standard error, for diagnostics
    pub stderr_tail: String,

    /// Wall-clock duration of the step
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.cancelled
    }
}

/// What a batch phase reports back to its caller
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration_ms: u64,
}

impl From<StepResult> for PhaseReport {
    fn from(result: StepResult) -> Self {
        Self {
            exit_code: result.exit_code,
            stdout_tail: result.stdout_tail,
            stderr_tail: result.stderr_tail,
            duration_ms: result.duration_ms,
        }
    }
}
