//! Log events streamed to observers of a running pipeline.
//!
//! Events are per-run and strictly ordered by emission time. Every stream
//! ends with exactly one `status` event carrying `done` or `error(<code>)`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One unit of a run's live output sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// What kind of event this is
    pub kind: LogEventKind,

    /// Event payload (one output line for `data`, a status token for `status`)
    pub payload: String,
}

impl LogEvent {
    /// An informational event (e.g., "pipeline starting")
    pub fn info(payload: impl Into<String>) -> Self {
        Self {
            kind: LogEventKind::Info,
            payload: payload.into(),
        }
    }

    /// One line of child output, trailing newline already stripped
    pub fn data(payload: impl Into<String>) -> Self {
        Self {
            kind: LogEventKind::Data,
            payload: payload.into(),
        }
    }

    /// Terminal status event for a clean exit
    pub fn status_done() -> Self {
        Self {
            kind: LogEventKind::Status,
            payload: "done".to_string(),
        }
    }

    /// Terminal status event for a failed or killed pipeline
    pub fn status_error(exit_code: i32) -> Self {
        Self {
            kind: LogEventKind::Status,
            payload: format!("error({})", exit_code),
        }
    }

    /// Whether this event terminates the stream
    pub fn is_terminal(&self) -> bool {
        self.kind == LogEventKind::Status
    }
}

/// Kind of log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    /// Out-of-band orchestrator message
    Info,

    /// One line of child process output
    Data,

    /// Terminal status (`done` or `error(<code>)`), always last
    Status,
}

impl fmt::Display for LogEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Data => "data",
            Self::Status => "status",
        };
        f.write_str(s)
    }
}
