//! Run supervisor: drives phases for one run and tracks its state machine.
//!
//! The lifecycle is `created → staging → staged → curating → ready →
//! streaming → terminal(succeeded|failed|crashed)`. Terminal states are
//! sticky, and at most one child process is ever active per run: a phase
//! start while another child runs is rejected with a conflict, never
//! duplicated. Every terminal transition is durably recorded in the
//! workspace so the outcome survives an orchestrator restart.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::broker::{LogBroker, LogStream, DEFAULT_CAPACITY};
use crate::core::runner::{LineTail, StepError, StepRunner, StreamSink, TAIL_LINES};
use crate::domain::{
    LogEvent, Phase, PhaseReport, PipelinePlan, RunState, RunStatus, Step, StepResult, StepSpec,
    TerminalRecord,
};
use crate::workspace::{Workspace, WorkspaceError};

/// Rejected phase starts and fatal step failures
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Phase invoked out of order; run state unchanged
    #[error("phase {phase} rejected: {reason}")]
    Precondition { phase: Phase, reason: String },

    /// Phase start attempted from a sticky terminal state
    #[error("run is terminal ({state}); create a new run to retry")]
    InvalidTransition { state: RunState },

    /// A child process is already active for this run
    #[error("a {phase} child is already active for this run")]
    Conflict { phase: Phase },

    /// Curating reported success but the declared artifact never appeared
    #[error("curated artifact `{name}` missing after curating phase")]
    ArtifactMissing { name: String },

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// Mutable run state guarded by one lock; never held across awaits
struct Inner {
    state: RunState,
    phase: Option<Phase>,
    exit_code: Option<i32>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cancel: Option<CancellationToken>,
}

impl Inner {
    fn validate(&self, requested: Phase) -> Result<(), SupervisorError> {
        if self.state.is_terminal() {
            return Err(SupervisorError::InvalidTransition { state: self.state });
        }
        if self.state.is_busy() {
            return Err(SupervisorError::Conflict {
                phase: self.phase.unwrap_or(requested),
            });
        }

        let required = entry_state(requested);
        if self.state != required {
            return Err(SupervisorError::Precondition {
                phase: requested,
                reason: format!("run is {}, must be {}", self.state, required),
            });
        }

        Ok(())
    }

    fn begin(&mut self, phase: Phase) -> Result<CancellationToken, SupervisorError> {
        self.validate(phase)?;

        self.state = running_state(phase);
        self.phase = Some(phase);
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        Ok(token)
    }
}

/// State a phase must be entered from
fn entry_state(phase: Phase) -> RunState {
    match phase {
        Phase::Staging => RunState::Created,
        Phase::Curating => RunState::Staged,
        Phase::Streaming => RunState::Ready,
    }
}

/// State a run is in while a phase's child is active
fn running_state(phase: Phase) -> RunState {
    match phase {
        Phase::Staging => RunState::Staging,
        Phase::Curating => RunState::Curating,
        Phase::Streaming => RunState::Streaming,
    }
}

/// Sequences step execution for one run and exposes its live stream.
///
/// Held behind `Arc` in the run registry; all methods are safe under
/// concurrent access from multiple client connections.
pub struct RunSupervisor {
    workspace: Workspace,
    plan: Arc<PipelinePlan>,
    runner: Arc<dyn StepRunner>,
    broker: Arc<LogBroker>,
    tail: Arc<Mutex<LineTail>>,
    inner: Mutex<Inner>,
}

impl RunSupervisor {
    pub fn new(workspace: Workspace, plan: Arc<PipelinePlan>, runner: Arc<dyn StepRunner>) -> Self {
        Self {
            workspace,
            plan,
            runner,
            broker: Arc::new(LogBroker::new(DEFAULT_CAPACITY)),
            tail: Arc::new(Mutex::new(LineTail::new(TAIL_LINES))),
            inner: Mutex::new(Inner {
                state: RunState::Created,
                phase: None,
                exit_code: None,
                error: None,
                started_at: None,
                finished_at: None,
                cancel: None,
            }),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run a one-shot batch phase to completion.
    ///
    /// Blocks the caller until the child exits. Nonzero exit is reported in
    /// the returned `PhaseReport`, not as an error; only launch failures
    /// and rejected transitions surface as errors.
    #[instrument(skip(self, extra_args), fields(run_id = %self.workspace.run_id(), %phase))]
    pub async fn run_batch(
        &self,
        phase: Phase,
        extra_args: &[String],
    ) -> Result<PhaseReport, SupervisorError> {
        let steps = match self.plan.batch_steps(phase) {
            Some(steps) => steps,
            None => {
                return Err(SupervisorError::Precondition {
                    phase,
                    reason: "streaming is not a batch phase".to_string(),
                })
            }
        };
        let next_state = if phase == Phase::Staging {
            RunState::Staged
        } else {
            RunState::Ready
        };

        let token = {
            let mut inner = self.inner.lock().expect("state lock poisoned");
            inner.begin(phase)?
        };
        info!("batch phase started");

        let mut last = StepResult::default();
        for (idx, spec) in steps.iter().enumerate() {
            // Caller-supplied args extend the first step of the phase
            let extra: &[String] = if idx == 0 { extra_args } else { &[] };
            let step = self.build_step(spec, extra, false);
            debug!(command = %step.command_line(), "running step");

            let result = match self.runner.run_batch(&step, &token).await {
                Ok(result) => result,
                Err(err) => {
                    error!(command = %step.command_line(), error = %err, "step could not run");
                    self.finish(RunState::Failed, None, Some(err.to_string())).await;
                    return Err(err.into());
                }
            };

            self.remember_tails(&result);

            if result.cancelled {
                warn!(command = %step.command_line(), "step terminated by operator");
                self.finish(RunState::Crashed, None, Some("terminated by operator".to_string()))
                    .await;
                return Ok(PhaseReport::from(result));
            }

            if !result.success() {
                warn!(
                    command = %step.command_line(),
                    exit_code = ?result.exit_code,
                    "step failed"
                );
                let message = format!(
                    "step `{}` exited with code {}",
                    step.command_line(),
                    result.exit_code.unwrap_or(-1)
                );
                self.finish(RunState::Failed, result.exit_code, Some(message)).await;
                return Ok(PhaseReport::from(result));
            }

            last = result;
        }

        if phase == Phase::Curating {
            let artifact = self.workspace.curated_artifact(&self.plan.curated_artifact)?;
            if fs::metadata(&artifact).await.is_err() {
                let name = self.plan.curated_artifact.clone();
                self.finish(
                    RunState::Failed,
                    last.exit_code,
                    Some(format!("curated artifact `{}` missing after curating phase", name)),
                )
                .await;
                return Err(SupervisorError::ArtifactMissing { name });
            }
        }

        {
            let mut inner = self.inner.lock().expect("state lock poisoned");
            inner.state = next_state;
            inner.exit_code = last.exit_code;
            inner.cancel = None;
        }
        info!(duration_ms = last.duration_ms, "batch phase completed");

        Ok(PhaseReport::from(last))
    }

    /// Launch the streaming pipeline phase.
    ///
    /// Returns once the child is launched; observers attach separately via
    /// [`RunSupervisor::attach`]. A background task forwards output to the
    /// broker and records the terminal state when the child exits.
    #[instrument(skip(self, extra_args), fields(run_id = %self.workspace.run_id()))]
    pub async fn start_streaming(
        self: Arc<Self>,
        extra_args: &[String],
    ) -> Result<(), SupervisorError> {
        {
            let inner = self.inner.lock().expect("state lock poisoned");
            inner.validate(Phase::Streaming)?;
        }

        let artifact = self.workspace.curated_artifact(&self.plan.curated_artifact)?;
        if fs::metadata(&artifact).await.is_err() {
            return Err(SupervisorError::Precondition {
                phase: Phase::Streaming,
                reason: format!(
                    "curated artifact `{}` not found; run the curating phase first",
                    self.plan.curated_artifact
                ),
            });
        }

        let token = {
            let mut inner = self.inner.lock().expect("state lock poisoned");
            inner.begin(Phase::Streaming)?
        };

        let step = self.build_step(&self.plan.streaming, extra_args, true);
        info!(command = %step.command_line(), "streaming phase launched");

        tokio::spawn(Arc::clone(&self).drive_streaming(step, token));
        Ok(())
    }

    async fn drive_streaming(self: Arc<Self>, step: Step, cancel: CancellationToken) {
        self.broker.publish(LogEvent::info(format!(
            "starting pipeline for run {}",
            self.workspace.run_id()
        )));

        let sink = StreamSink::new(Arc::clone(&self.broker), Arc::clone(&self.tail));
        let outcome = self.runner.run_streamed(&step, &sink, &cancel).await;

        let (state, exit_code, error, status_event) = match outcome {
            Ok(result) => match (result.exit_code, result.cancelled) {
                (Some(0), false) => (RunState::Succeeded, Some(0), None, LogEvent::status_done()),
                (Some(code), false) => (
                    RunState::Failed,
                    Some(code),
                    Some(format!("pipeline exited with code {}", code)),
                    LogEvent::status_error(code),
                ),
                (_, true) => (
                    RunState::Crashed,
                    None,
                    Some("terminated by operator".to_string()),
                    LogEvent::status_error(-1),
                ),
                (None, false) => (
                    RunState::Crashed,
                    None,
                    Some("pipeline killed by signal".to_string()),
                    LogEvent::status_error(-1),
                ),
            },
            Err(err @ StepError::Launch { .. }) => {
                let message = err.to_string();
                (RunState::Failed, None, Some(message), LogEvent::status_error(-1))
            }
            Err(err) => (
                RunState::Crashed,
                None,
                Some(err.to_string()),
                LogEvent::status_error(-1),
            ),
        };

        match state {
            RunState::Succeeded => info!(run_id = %self.workspace.run_id(), "streaming phase succeeded"),
            _ => warn!(
                run_id = %self.workspace.run_id(),
                %state,
                error = error.as_deref().unwrap_or(""),
                "streaming phase did not succeed"
            ),
        }

        self.finish(state, exit_code, error).await;

        // The terminal status event is guaranteed to be the last event
        self.broker.publish(status_event);
        self.broker.close();
    }

    /// Attach an observer to the run's live event stream
    pub fn attach(&self) -> LogStream {
        self.broker.subscribe()
    }

    /// Point-in-time snapshot, always available even with no observers
    pub fn status(&self) -> RunStatus {
        let inner = self.inner.lock().expect("state lock poisoned");
        RunStatus {
            run_id: self.workspace.run_id().clone(),
            phase: inner.phase,
            state: inner.state,
            exit_code: inner.exit_code,
            error: inner.error.clone(),
            tail: self.tail.lock().expect("tail lock poisoned").snapshot(),
            started_at: inner.started_at,
            finished_at: inner.finished_at,
        }
    }

    /// Operator kill switch: cancel the active child, driving the run to
    /// `crashed`. Returns false when no child is active.
    pub fn terminate(&self) -> bool {
        let token = {
            let inner = self.inner.lock().expect("state lock poisoned");
            inner.cancel.clone()
        };

        match token {
            Some(token) => {
                warn!(run_id = %self.workspace.run_id(), "terminating active child");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Record a terminal state in memory and durably in the workspace
    async fn finish(&self, state: RunState, exit_code: Option<i32>, error: Option<String>) {
        let finished_at = Utc::now();
        let record = {
            let mut inner = self.inner.lock().expect("state lock poisoned");
            inner.state = state;
            inner.exit_code = exit_code;
            inner.error = error.clone();
            inner.finished_at = Some(finished_at);
            inner.cancel = None;

            TerminalRecord {
                state,
                phase: inner.phase,
                exit_code,
                error,
                tail: self.tail.lock().expect("tail lock poisoned").snapshot(),
                started_at: inner.started_at,
                finished_at,
            }
        };

        match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => {
                if let Err(e) = fs::write(self.workspace.status_path(), bytes).await {
                    error!(error = %e, "failed to write terminal record");
                }
            }
            Err(e) => error!(error = %e, "failed to encode terminal record"),
        }
    }

    /// Materialize a step: plan args plus caller args, environment overlay
    /// always pinned to this run's workspace root.
    fn build_step(&self, spec: &StepSpec, extra_args: &[String], streaming: bool) -> Step {
        let mut args = spec.args.clone();
        args.extend(extra_args.iter().cloned());

        let mut env: Vec<(String, String)> = spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // Pushed last so the workspace scoping always wins
        env.push((
            crate::config::DATA_ROOT_ENV.to_string(),
            self.workspace.root().display().to_string(),
        ));

        Step {
            program: spec.program.clone(),
            args,
            env,
            pid_file: streaming.then(|| self.workspace.pid_path()),
        }
    }

    /// Keep batch-step tails available for status previews
    fn remember_tails(&self, result: &StepResult) {
        let mut tail = self.tail.lock().expect("tail lock poisoned");
        for line in result.stdout_tail.lines().chain(result.stderr_tail.lines()) {
            tail.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::domain::LogEventKind;
    use crate::workspace::WorkspaceManager;

    /// Deterministic runner for state-machine tests: no real processes
    struct ScriptedRunner {
        exit_code: i32,
        delay_ms: u64,
        lines: Vec<&'static str>,
    }

    impl ScriptedRunner {
        fn exiting(exit_code: i32) -> Self {
            Self {
                exit_code,
                delay_ms: 0,
                lines: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        async fn run_batch(
            &self,
            _step: &Step,
            cancel: &CancellationToken,
        ) -> Result<StepResult, StepError> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
                _ = cancel.cancelled() => {
                    return Ok(StepResult { cancelled: true, ..Default::default() });
                }
            }
            Ok(StepResult {
                exit_code: Some(self.exit_code),
                ..Default::default()
            })
        }

        async fn run_streamed(
            &self,
            _step: &Step,
            sink: &StreamSink,
            _cancel: &CancellationToken,
        ) -> Result<StepResult, StepError> {
            for line in &self.lines {
                sink.line(line);
            }
            Ok(StepResult {
                exit_code: Some(self.exit_code),
                ..Default::default()
            })
        }
    }

    fn spec(program: &str) -> StepSpec {
        StepSpec {
            program: program.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    fn test_plan() -> PipelinePlan {
        PipelinePlan {
            name: "test".to_string(),
            description: String::new(),
            staging: vec![spec("true")],
            curating: vec![spec("true")],
            streaming: spec("true"),
            curated_artifact: "cleaned.csv".to_string(),
        }
    }

    async fn supervisor_with(runner: Arc<dyn StepRunner>) -> (Arc<RunSupervisor>, TempDir) {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path().join("runs"));
        let workspace = manager.create().await.unwrap();
        let supervisor = RunSupervisor::new(workspace, Arc::new(test_plan()), runner);
        (Arc::new(supervisor), temp)
    }

    async fn write_curated_artifact(supervisor: &RunSupervisor) {
        let path = supervisor.workspace().curated_artifact("cleaned.csv").unwrap();
        tokio::fs::write(&path, b"id,score\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let (sup, _temp) = supervisor_with(Arc::new(ScriptedRunner::exiting(0))).await;

        assert_eq!(sup.status().state, RunState::Created);

        let report = sup.run_batch(Phase::Staging, &[]).await.unwrap();
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(sup.status().state, RunState::Staged);

        write_curated_artifact(&sup).await;
        sup.run_batch(Phase::Curating, &[]).await.unwrap();
        assert_eq!(sup.status().state, RunState::Ready);
        assert_eq!(sup.status().phase, Some(Phase::Curating));
    }

    #[tokio::test]
    async fn test_failed_step_is_reported_not_raised() {
        let (sup, _temp) = supervisor_with(Arc::new(ScriptedRunner::exiting(2))).await;

        let report = sup.run_batch(Phase::Staging, &[]).await.unwrap();
        assert_eq!(report.exit_code, Some(2));

        let status = sup.status();
        assert_eq!(status.state, RunState::Failed);
        assert!(status.error.unwrap().contains("exited with code 2"));
    }

    #[tokio::test]
    async fn test_terminal_states_are_sticky() {
        let (sup, _temp) = supervisor_with(Arc::new(ScriptedRunner::exiting(1))).await;

        sup.run_batch(Phase::Staging, &[]).await.unwrap();
        assert_eq!(sup.status().state, RunState::Failed);

        let err = sup.run_batch(Phase::Staging, &[]).await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidTransition { state: RunState::Failed }));

        // Status unchanged by the rejected request
        assert_eq!(sup.status().state, RunState::Failed);
    }

    #[tokio::test]
    async fn test_curate_before_stage_is_rejected() {
        let (sup, _temp) = supervisor_with(Arc::new(ScriptedRunner::exiting(0))).await;

        let err = sup.run_batch(Phase::Curating, &[]).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Precondition { phase: Phase::Curating, .. }));
        assert_eq!(sup.status().state, RunState::Created);
    }

    #[tokio::test]
    async fn test_concurrent_phase_start_conflicts() {
        let runner = Arc::new(ScriptedRunner {
            exit_code: 0,
            delay_ms: 300,
            lines: Vec::new(),
        });
        let (sup, _temp) = supervisor_with(runner).await;

        let racing = Arc::clone(&sup);
        let first = tokio::spawn(async move { racing.run_batch(Phase::Staging, &[]).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = sup.run_batch(Phase::Staging, &[]).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Conflict { .. }));

        first.await.unwrap().unwrap();
        assert_eq!(sup.status().state, RunState::Staged);
    }

    #[tokio::test]
    async fn test_curating_must_produce_the_artifact() {
        let (sup, _temp) = supervisor_with(Arc::new(ScriptedRunner::exiting(0))).await;

        sup.run_batch(Phase::Staging, &[]).await.unwrap();

        // Runner reports success but never writes cleaned.csv
        let err = sup.run_batch(Phase::Curating, &[]).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ArtifactMissing { .. }));
        assert_eq!(sup.status().state, RunState::Failed);
    }

    #[tokio::test]
    async fn test_streaming_requires_curated_artifact() {
        let (sup, _temp) = supervisor_with(Arc::new(ScriptedRunner::exiting(0))).await;

        let err = Arc::clone(&sup).start_streaming(&[]).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Precondition { phase: Phase::Streaming, .. }));
        assert_eq!(sup.status().state, RunState::Created);
    }

    #[tokio::test]
    async fn test_streaming_emits_ordered_events_and_succeeds() {
        let runner = Arc::new(ScriptedRunner {
            exit_code: 0,
            delay_ms: 0,
            lines: vec!["row 1", "row 2"],
        });
        let (sup, _temp) = supervisor_with(runner).await;

        sup.run_batch(Phase::Staging, &[]).await.unwrap();
        write_curated_artifact(&sup).await;
        sup.run_batch(Phase::Curating, &[]).await.unwrap();

        let mut stream = sup.attach();
        Arc::clone(&sup).start_streaming(&[]).await.unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, LogEventKind::Info);

        assert_eq!(stream.next().await, Some(LogEvent::data("row 1")));
        assert_eq!(stream.next().await, Some(LogEvent::data("row 2")));
        assert_eq!(stream.next().await, Some(LogEvent::status_done()));
        assert_eq!(stream.next().await, None);

        let status = sup.status();
        assert_eq!(status.state, RunState::Succeeded);
        assert_eq!(status.exit_code, Some(0));
        assert!(status.tail.contains(&"row 2".to_string()));

        // Terminal record written for post-restart retrieval
        assert!(sup.workspace().status_path().exists());
    }

    #[tokio::test]
    async fn test_terminate_without_active_child() {
        let (sup, _temp) = supervisor_with(Arc::new(ScriptedRunner::exiting(0))).await;
        assert!(!sup.terminate());
    }

    #[tokio::test]
    async fn test_build_step_scopes_environment() {
        let (sup, _temp) = supervisor_with(Arc::new(ScriptedRunner::exiting(0))).await;

        let mut spec = spec("python3");
        spec.args = vec!["-m".to_string(), "pipeline.mockgen".to_string()];
        let extra = vec!["--rows".to_string(), "50".to_string()];

        let step = sup.build_step(&spec, &extra, true);

        assert_eq!(step.args, vec!["-m", "pipeline.mockgen", "--rows", "50"]);
        assert_eq!(step.pid_file, Some(sup.workspace().pid_path()));

        let root = sup.workspace().root().display().to_string();
        assert!(step
            .env
            .iter()
            .any(|(k, v)| k == crate::config::DATA_ROOT_ENV && *v == root));
    }
}
