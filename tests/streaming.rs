//! Live stream tests: ordering, fan-out, detachment, and mid-stream kills.

use std::collections::HashMap;
use std::sync::Arc;

use stagehand::{
    Config, LogEvent, LogEventKind, Orchestrator, Phase, PipelinePlan, RunId, RunState, StepSpec,
};
use tempfile::TempDir;

fn sh(script: &str) -> StepSpec {
    StepSpec {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: HashMap::new(),
    }
}

fn plan_with_streaming(script: &str) -> PipelinePlan {
    PipelinePlan {
        name: "stream-test".to_string(),
        description: String::new(),
        staging: vec![sh(r#"printf 'seed\n' > "$STAGEHAND_DATA_ROOT/raw/input.txt""#)],
        curating: vec![sh(
            r#"cp "$STAGEHAND_DATA_ROOT/raw/input.txt" "$STAGEHAND_DATA_ROOT/curated/cleaned.csv""#,
        )],
        streaming: sh(script),
        curated_artifact: "cleaned.csv".to_string(),
    }
}

/// Create a run and drive it to the ready state
async fn ready_run(orch: &Orchestrator) -> RunId {
    let run_id = orch.create_run().await.unwrap();
    let staging = orch
        .run_batch_phase(&run_id, Phase::Staging, &[])
        .await
        .unwrap();
    assert_eq!(staging.exit_code, Some(0));
    let curating = orch
        .run_batch_phase(&run_id, Phase::Curating, &[])
        .await
        .unwrap();
    assert_eq!(curating.exit_code, Some(0));
    run_id
}

fn orchestrator(plan: PipelinePlan) -> (Arc<Orchestrator>, TempDir) {
    let temp = TempDir::new().unwrap();
    let config = Config::with_data_root(temp.path().to_path_buf());
    (Arc::new(Orchestrator::new(&config, plan)), temp)
}

#[tokio::test]
async fn test_observer_receives_exact_ordered_sequence() {
    let (orch, _temp) = orchestrator(plan_with_streaming("echo L1; echo L2; echo L3"));
    let run_id = ready_run(&orch).await;

    let mut stream = orch.attach_stream(&run_id).unwrap();
    orch.start_streaming_phase(&run_id, &[]).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert_eq!(events.len(), 5);
    assert_eq!(events[0].kind, LogEventKind::Info);
    assert_eq!(events[1], LogEvent::data("L1"));
    assert_eq!(events[2], LogEvent::data("L2"));
    assert_eq!(events[3], LogEvent::data("L3"));
    assert_eq!(events[4], LogEvent::status_done());
}

#[tokio::test]
async fn test_fan_out_and_independent_detach() {
    let (orch, _temp) = orchestrator(plan_with_streaming(
        "echo L1; sleep 0.3; echo L2; sleep 0.3; echo L3",
    ));
    let run_id = ready_run(&orch).await;

    let mut first = orch.attach_stream(&run_id).unwrap();
    let mut second = orch.attach_stream(&run_id).unwrap();

    orch.start_streaming_phase(&run_id, &[]).await.unwrap();

    // First observer reads a little, then disconnects mid-stream
    assert_eq!(first.next().await.unwrap().kind, LogEventKind::Info);
    assert_eq!(first.next().await, Some(LogEvent::data("L1")));
    drop(first);

    // The detach must not affect the second observer's full delivery
    let mut events = Vec::new();
    while let Some(event) = second.next().await {
        events.push(event);
    }

    assert_eq!(events[0].kind, LogEventKind::Info);
    assert_eq!(events[1], LogEvent::data("L1"));
    assert_eq!(events[2], LogEvent::data("L2"));
    assert_eq!(events[3], LogEvent::data("L3"));
    assert_eq!(events[4], LogEvent::status_done());

    let status = orch.run_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Succeeded);
}

#[tokio::test]
async fn test_attach_after_terminal_yields_empty_stream() {
    let (orch, _temp) = orchestrator(plan_with_streaming("echo only"));
    let run_id = ready_run(&orch).await;

    let mut live = orch.attach_stream(&run_id).unwrap();
    orch.start_streaming_phase(&run_id, &[]).await.unwrap();
    while live.next().await.is_some() {}

    // A live feed, not a replay: nothing is delivered after the end
    let mut late = orch.attach_stream(&run_id).unwrap();
    assert_eq!(late.next().await, None);
}

#[tokio::test]
async fn test_nonzero_exit_streams_error_status() {
    let (orch, _temp) = orchestrator(plan_with_streaming("echo oops; exit 4"));
    let run_id = ready_run(&orch).await;

    let mut stream = orch.attach_stream(&run_id).unwrap();
    orch.start_streaming_phase(&run_id, &[]).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    let last = events.last().unwrap();
    assert_eq!(last, &LogEvent::status_error(4));

    let status = orch.run_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Failed);
    assert_eq!(status.exit_code, Some(4));
}

#[tokio::test]
async fn test_terminate_mid_stream_crashes_run_and_closes_stream() {
    let (orch, _temp) = orchestrator(plan_with_streaming(
        "while :; do echo tick; sleep 0.1; done",
    ));
    let run_id = ready_run(&orch).await;

    let mut stream = orch.attach_stream(&run_id).unwrap();
    orch.start_streaming_phase(&run_id, &[]).await.unwrap();

    // Wait until the child is demonstrably producing output
    loop {
        let event = stream.next().await.unwrap();
        if event.kind == LogEventKind::Data {
            assert_eq!(event.payload, "tick");
            break;
        }
    }

    assert!(orch.terminate_run(&run_id).unwrap());

    // Even on a kill, the terminal status event arrives before the close
    let mut saw_status = false;
    while let Some(event) = stream.next().await {
        if event.is_terminal() {
            assert_eq!(event, LogEvent::status_error(-1));
            saw_status = true;
        }
    }
    assert!(saw_status);

    let status = orch.run_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Crashed);
    assert!(status.error.unwrap().contains("terminated by operator"));

    // Nothing left to terminate
    assert!(!orch.terminate_run(&run_id).unwrap());
}
