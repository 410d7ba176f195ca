//! Run identity, lifecycle states, and status snapshots.
//!
//! A run is one isolated execution context with its own workspace. The
//! lifecycle is a strict state machine: `created → staging → staged →
//! curating → ready → streaming → terminal`, with sticky terminal states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of the generated run token (hex characters)
const RUN_ID_LEN: usize = 12;

/// Opaque run identifier: a 12-character lowercase-hex token.
///
/// URL-safe and collision-resistant; the id space is large enough that
/// collisions are structurally prevented rather than retried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(hex[..RUN_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A named stage of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// One-shot batch phase that populates the raw staging area
    Staging,

    /// One-shot batch phase that transforms staged input into the curated artifact
    Curating,

    /// Long-running phase whose output is live-multiplexed to observers
    Streaming,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Curating => "curating",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staging" => Ok(Self::Staging),
            "curating" => Ok(Self::Curating),
            "streaming" => Ok(Self::Streaming),
            other => Err(format!("unknown phase `{}`", other)),
        }
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Workspace exists, no steps run yet
    Created,

    /// Staging batch phase is executing
    Staging,

    /// Staging completed, ready for curating
    Staged,

    /// Curating batch phase is executing
    Curating,

    /// Curated artifact produced, ready for streaming
    Ready,

    /// Streaming pipeline child is live
    Streaming,

    /// Terminal: pipeline completed with exit code 0
    Succeeded,

    /// Terminal: a step exited nonzero or could not launch
    Failed,

    /// Terminal: child killed, terminated by operator, or mid-stream I/O failure
    Crashed,
}

impl RunState {
    /// Terminal states are sticky: no phase may start from them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Crashed)
    }

    /// Whether a child process is currently active for this run
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Staging | Self::Curating | Self::Streaming)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Staging => "staging",
            Self::Staged => "staged",
            Self::Curating => "curating",
            Self::Ready => "ready",
            Self::Streaming => "streaming",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of a run, always available regardless of observers
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: RunId,

    /// Current or most recent phase (none before the first phase starts)
    pub phase: Option<Phase>,

    pub state: RunState,

    /// Exit code of the most recently completed step, if any
    pub exit_code: Option<i32>,

    /// Diagnostic message for failed/crashed runs
    pub error: Option<String>,

    /// Bounded tail of recent output lines, for non-streaming preview
    pub tail: Vec<String>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    /// Status of a workspace with no recorded activity.
    ///
    /// Used when only the on-disk directory is known (e.g., after an
    /// orchestrator restart with no terminal record written).
    pub fn created(run_id: RunId) -> Self {
        Self {
            run_id,
            phase: None,
            state: RunState::Created,
            exit_code: None,
            error: None,
            tail: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Durable record of a run's terminal state, written as `status.json`
/// inside the workspace so the outcome survives an orchestrator restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub state: RunState,
    pub phase: Option<Phase>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub tail: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl TerminalRecord {
    /// Rehydrate a status snapshot from the durable record
    pub fn into_status(self, run_id: RunId) -> RunStatus {
        RunStatus {
            run_id,
            phase: self.phase,
            state: self.state,
            exit_code: self.exit_code,
            error: self.error,
            tail: self.tail,
            started_at: self.started_at,
            finished_at: Some(self.finished_at),
        }
    }
}
