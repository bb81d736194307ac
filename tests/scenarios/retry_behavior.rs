//! Test: classified failures, retries and backoff

use crate::helpers::*;
use adflow::core::{
    payload, RunStatus, SkipReason, StepDefinition, StepFailure, StepState, WorkflowDefinition,
};
use adflow::events::EventKind;
use adflow::execution::{Decision, RecoveryPolicy};
use adflow::generation::GenerationError;
use adflow::{ErrorKind, StepError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn unavailable() -> Reply {
    Reply::Fail(GenerationError::Unavailable("connection reset".to_string()))
}

#[tokio::test]
async fn test_transient_failures_retry_with_backoff() {
    let generator = ScriptedGenerator::new().script(
        "facebook",
        vec![unavailable(), unavailable(), Reply::Text("fb copy".to_string())],
    );
    let engine = engine(generator.clone());
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    let run = within(engine.wait(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::AwaitingReview);
    assert_eq!(run.step("facebook").unwrap().attempts, 3);
    assert_eq!(run.outputs["content_facebook"], json!("fb copy"));
    assert_eq!(
        error_kinds(&run, "facebook"),
        vec![ErrorKind::Transient, ErrorKind::Transient]
    );
    assert_eq!(generator.calls_for("facebook"), 3);

    engine.cancel(run_id).await.unwrap();
    within(engine.wait_for_terminal(run_id)).await.unwrap();
    let events = events_of(&engine, run_id).await;

    let attempts: Vec<u64> = events_for(&events, "facebook", EventKind::StepStarted)
        .iter()
        .filter_map(|e| e.field_u64("attempt"))
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let failed = events_for(&events, "facebook", EventKind::StepFailed);
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|e| e.payload["will_retry"] == json!(true)));

    let delays: Vec<u64> = events_for(&events, "facebook", EventKind::RunRecovering)
        .iter()
        .filter_map(|e| e.field_u64("delay_ms"))
        .collect();
    assert_eq!(delays, vec![10, 20]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(
        events_for(&events, "facebook", EventKind::StepCompleted).len(),
        1
    );
}

#[tokio::test]
async fn test_rate_limit_waits_at_least_floor() {
    let generator = ScriptedGenerator::new().script(
        "instagram",
        vec![Reply::Fail(GenerationError::RateLimited(
            "quota exceeded".to_string(),
        ))],
    );
    let engine = engine(generator);
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    within(engine.wait(run_id)).await.unwrap();
    engine.cancel(run_id).await.unwrap();
    within(engine.wait_for_terminal(run_id)).await.unwrap();

    let events = events_of(&engine, run_id).await;
    let recovering = events_for(&events, "instagram", EventKind::RunRecovering);
    assert_eq!(recovering.len(), 1);
    assert_eq!(recovering[0].field_str("kind"), Some("resource_exhausted"));
    assert!(recovering[0].field_u64("delay_ms").unwrap() >= 40);
}

#[tokio::test]
async fn test_exhausted_retries_drop_group_member() {
    let generator =
        ScriptedGenerator::new().script("facebook", (0..4).map(|_| unavailable()).collect());
    let engine = engine(generator.clone());
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    let run = within(engine.wait(run_id)).await.unwrap();

    // One attempt plus three retries
    assert_eq!(generator.calls_for("facebook"), 4);
    assert_eq!(
        run.step_state("facebook"),
        Some(&StepState::Skipped {
            reason: SkipReason::BranchDropped
        })
    );
    assert_eq!(run.status, RunStatus::AwaitingReview);

    engine.approve(run_id, true, Default::default()).await.unwrap();
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(!run.outputs.contains_key("content_facebook"));
}

#[tokio::test]
async fn test_repeated_timeout_is_not_retried() {
    let workflow = WorkflowDefinition::builder("slow")
        .step(
            StepDefinition::generate("draft", "Write")
                .with_outputs(&["draft"])
                .with_timeout(Some(Duration::from_millis(30)))
                .with_max_retries(3),
        )
        .build()
        .unwrap();
    let slow = || Reply::Slow(Duration::from_secs(5), "late".to_string());
    let generator = ScriptedGenerator::new().script("draft", vec![slow(), slow(), slow()]);
    let engine = engine(generator.clone());

    let run_id = engine.submit(workflow, Default::default()).await.unwrap();
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(generator.calls_for("draft"), 2);
    assert_eq!(
        error_kinds(&run, "draft"),
        vec![ErrorKind::Timeout, ErrorKind::Timeout]
    );
    let cause = run.cause.unwrap();
    assert_eq!(cause.kind, ErrorKind::Timeout);
    assert_eq!(cause.step_id.as_deref(), Some("draft"));
}

#[tokio::test]
async fn test_missing_input_fails_without_starting() {
    let generator = ScriptedGenerator::new();
    let engine = engine(generator.clone());
    let (workflow, _) = campaign();

    // "audience" is never supplied
    let inputs = payload([("objective", json!("launch")), ("budget", json!(100))]);
    let run_id = engine.submit(workflow, inputs).await.unwrap();
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(error_kinds(&run, "strategy"), vec![ErrorKind::MissingInput]);
    assert!(generator.calls().is_empty());

    let events = events_of(&engine, run_id).await;
    assert!(events_for(&events, "strategy", EventKind::StepStarted).is_empty());
    assert_eq!(events_for(&events, "strategy", EventKind::StepFailed).len(), 1);
    assert_eq!(events.last().unwrap().kind, EventKind::RunAborted);
    assert!(run
        .steps
        .iter()
        .filter(|(id, _)| *id != "strategy")
        .all(|(_, r)| matches!(r.state, StepState::Skipped { .. })));
}

/// Retries after the longest representable delay
struct Forever;

impl RecoveryPolicy for Forever {
    fn decide(
        &self,
        _step: &StepDefinition,
        _attempt: u32,
        _error: &StepError,
        _history: &[StepFailure],
    ) -> Decision {
        Decision::Retry(Duration::MAX)
    }
}

#[tokio::test]
async fn test_huge_retry_delay_saturates_in_event() {
    let workflow = WorkflowDefinition::builder("single")
        .step(StepDefinition::generate("copy", "Write").with_outputs(&["copy"]))
        .build()
        .unwrap();
    let generator = ScriptedGenerator::new().script("copy", vec![unavailable()]);
    let engine = engine(generator.clone()).with_policy(Arc::new(Forever));

    let run_id = engine.submit(workflow, Default::default()).await.unwrap();
    let mut events = engine.subscribe(run_id, 0).unwrap();
    let recovering = within(async {
        loop {
            match events.next().await {
                Some(event) if event.kind == EventKind::RunRecovering => break event,
                Some(_) => continue,
                None => panic!("log closed before the retry was scheduled"),
            }
        }
    })
    .await;
    assert_eq!(recovering.field_u64("delay_ms"), Some(u64::MAX));

    assert_eq!(engine.cancel(run_id).await.unwrap(), RunStatus::Aborted);
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(generator.calls_for("copy"), 1);
}
