//! Step runner: executes one external command with captured output.
//!
//! Two modes share one launch path. Batch steps capture bounded trailing
//! tails of stdout and stderr without holding full output in memory.
//! Streamed steps forward stdout and stderr line-by-line, as the child
//! flushes, into a `StreamSink`. A child that block-buffers its own output
//! will appear to stall; that is a property of the child program, not of
//! the runner.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::broker::LogBroker;
use crate::domain::{LogEvent, Step, StepResult};

/// Trailing stdout kept for batch-step diagnostics
pub const STDOUT_TAIL_CHARS: usize = 800;

/// Trailing stderr kept for batch-step diagnostics
pub const STDERR_TAIL_CHARS: usize = 1200;

/// Recent output lines kept per run for non-streaming preview
pub const TAIL_LINES: usize = 200;

/// How long to wait for output readers after the child exits.
///
/// Normally the pipes drain immediately; if they are backed up we give up
/// rather than hang the run forever.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that abort a step before or outside normal child exit
#[derive(Debug, Error)]
pub enum StepError {
    /// The child process could not start; always fatal to the run
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while reading child output
    #[error("i/o failure reading child output: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes steps; the supervisor holds this behind a trait object so
/// tests can substitute a scripted implementation.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run a one-shot batch step to completion, capturing output tails
    async fn run_batch(
        &self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError>;

    /// Run a streamed step, forwarding each output line to the sink
    async fn run_streamed(
        &self,
        step: &Step,
        sink: &StreamSink,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError>;
}

/// Ring of the most recent output lines
#[derive(Debug)]
pub struct LineTail {
    cap: usize,
    lines: VecDeque<String>,
}

impl LineTail {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            lines: VecDeque::with_capacity(cap),
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Where a streamed step's lines go: the run's broker (live observers)
/// and its bounded line tail (status previews).
#[derive(Clone)]
pub struct StreamSink {
    broker: Arc<LogBroker>,
    tail: Arc<Mutex<LineTail>>,
}

impl StreamSink {
    pub fn new(broker: Arc<LogBroker>, tail: Arc<Mutex<LineTail>>) -> Self {
        Self { broker, tail }
    }

    /// Forward one output line (trailing newline already stripped)
    pub fn line(&self, text: &str) {
        self.tail.lock().expect("tail lock poisoned").push(text);
        self.broker.publish(LogEvent::data(text));
    }
}

/// Bounded trailing-text capture; keeps only the last `cap` characters
struct CharTail {
    cap: usize,
    buf: String,
}

impl CharTail {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: String::new(),
        }
    }

    fn push_str(&mut self, text: &str) {
        self.buf.push_str(text);

        // Trim lazily so most pushes are a plain append
        if self.buf.len() > self.cap * 2 {
            self.trim();
        }
    }

    fn trim(&mut self) {
        if self.buf.len() <= self.cap {
            return;
        }
        let mut cut = self.buf.len() - self.cap;
        while !self.buf.is_char_boundary(cut) {
            cut += 1;
        }
        self.buf.drain(..cut);
    }

    fn into_string(mut self) -> String {
        self.trim();
        self.buf
    }
}

/// The real process-backed step runner
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepRunner for ProcessRunner {
    async fn run_batch(
        &self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let started = Instant::now();
        let mut child = spawn(step)?;

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(capture_tail(out, STDOUT_TAIL_CHARS)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(capture_tail(err, STDERR_TAIL_CHARS)));

        let (exit_code, cancelled) = wait_or_cancel(&mut child, cancel).await?;

        let stdout_tail = drain_capture(stdout_task).await;
        let stderr_tail = drain_capture(stderr_task).await;

        debug!(
            command = %step.command_line(),
            ?exit_code,
            cancelled,
            "batch step finished"
        );

        Ok(StepResult {
            exit_code,
            cancelled,
            stdout_tail,
            stderr_tail,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn run_streamed(
        &self,
        step: &Step,
        sink: &StreamSink,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let started = Instant::now();
        let mut child = spawn(step)?;

        if let Some(path) = &step.pid_file {
            if let Some(pid) = child.id() {
                if let Err(e) = tokio::fs::write(path, pid.to_string()).await {
                    warn!(error = %e, path = %path.display(), "failed to write pid marker");
                }
            }
        }

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, sink.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, sink.clone())));

        let (exit_code, cancelled) = wait_or_cancel(&mut child, cancel).await?;

        let out_result = drain_forward(stdout_task).await;
        let err_result = drain_forward(stderr_task).await;

        // Reader failures after a kill are expected noise; otherwise a
        // mid-stream I/O failure is fatal to the run.
        if !cancelled {
            out_result?;
            err_result?;
        }

        debug!(
            command = %step.command_line(),
            ?exit_code,
            cancelled,
            "streamed step finished"
        );

        Ok(StepResult {
            exit_code,
            cancelled,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn spawn(step: &Step) -> Result<Child, StepError> {
    let mut cmd = Command::new(&step.program);
    cmd.args(&step.args)
        .envs(step.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn().map_err(|source| StepError::Launch {
        command: step.command_line(),
        source,
    })
}

/// Block until the child exits or the cancellation signal fires.
///
/// On cancellation the child is killed; the caller sees `(None, true)`.
async fn wait_or_cancel(
    child: &mut Child,
    cancel: &CancellationToken,
) -> Result<(Option<i32>, bool), StepError> {
    tokio::select! {
        status = child.wait() => Ok((status?.code(), false)),
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill cancelled child");
            }
            Ok((None, true))
        }
    }
}

/// Read a pipe to EOF keeping only the trailing `cap` characters
async fn capture_tail<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<String> {
    let mut tail = CharTail::new(cap);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        tail.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }

    Ok(tail.into_string())
}

/// Forward a pipe to the sink one line at a time, as the child flushes
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, sink: StreamSink) -> std::io::Result<()> {
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        sink.line(&line);
    }

    Ok(())
}

async fn drain_capture(task: Option<JoinHandle<std::io::Result<String>>>) -> String {
    let Some(task) = task else {
        return String::new();
    };

    match timeout(IO_DRAIN_TIMEOUT, task).await {
        Ok(Ok(Ok(tail))) => tail,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "error reading child output");
            String::new()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "output reader task panicked");
            String::new()
        }
        Err(_) => {
            warn!("timed out draining child output");
            String::new()
        }
    }
}

async fn drain_forward(task: Option<JoinHandle<std::io::Result<()>>>) -> Result<(), StepError> {
    let Some(task) = task else {
        return Ok(());
    };

    match timeout(IO_DRAIN_TIMEOUT, task).await {
        Ok(Ok(result)) => result.map_err(StepError::from),
        Ok(Err(join_err)) => Err(StepError::Io(std::io::Error::other(join_err))),
        Err(_) => Err(StepError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out draining child output",
        ))),
    }
}
