//! Test: cooperative cancellation

use crate::helpers::*;
use adflow::core::config::{EngineConfig, RecoveryConfig};
use adflow::core::{RunStatus, SkipReason, StepState};
use adflow::events::{EventKind, Subscription};
use adflow::generation::GenerationError;
use adflow::{EngineError, ErrorKind, ExecutionEngine, Run, RunStore};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Read events until one of `kind` arrives
async fn until(events: &mut Subscription, kind: EventKind) {
    while let Some(event) = events.next().await {
        if event.kind == kind {
            return;
        }
    }
    panic!("log closed before {:?}", kind);
}

/// Poll the store until the run's snapshot there is terminal
async fn settled(store: &Arc<dyn RunStore>, run_id: Uuid) -> Run {
    loop {
        if let Some(run) = store.load_run(run_id).await.unwrap() {
            if run.status.is_terminal() {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_cancel_stops_in_flight_attempt() {
    let generator = ScriptedGenerator::new().script("strategy", vec![Reply::Hang]);
    let engine = engine(generator);
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    let mut events = engine.subscribe(run_id, 0).unwrap();
    within(until(&mut events, EventKind::StepStarted)).await;

    assert_eq!(engine.cancel(run_id).await.unwrap(), RunStatus::Aborted);
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    let cause = run.cause.clone().unwrap();
    assert_eq!(cause.kind, ErrorKind::Cancelled);
    assert!(cause.step_id.is_none());

    assert_eq!(run.step_state("strategy"), Some(&StepState::Failed));
    assert_eq!(error_kinds(&run, "strategy"), vec![ErrorKind::Cancelled]);
    for step in ["facebook", "instagram", "review", "budget"] {
        assert_eq!(
            run.step_state(step),
            Some(&StepState::Skipped {
                reason: SkipReason::RunAborted
            })
        );
    }

    let events = events_of(&engine, run_id).await;
    assert_terminal_event_last(&events);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::RunAborted);
    assert_eq!(last.field_str("kind"), Some("cancelled"));
}

#[tokio::test]
async fn test_cancel_while_awaiting_review() {
    let engine = engine(ScriptedGenerator::new());
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    within(engine.wait(run_id)).await.unwrap();

    assert_eq!(engine.cancel(run_id).await.unwrap(), RunStatus::Aborted);
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    for step in ["review", "budget"] {
        assert_eq!(
            run.step_state(step),
            Some(&StepState::Skipped {
                reason: SkipReason::RunAborted
            })
        );
    }
    assert!(run.outputs.contains_key("content_instagram"));
    assert_eq!(
        engine.approve(run_id, true, Default::default()).await.unwrap(),
        RunStatus::Aborted
    );
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let generator = ScriptedGenerator::new().script(
        "strategy",
        vec![Reply::Fail(GenerationError::Unavailable("down".to_string()))],
    );
    let config = EngineConfig {
        recovery: RecoveryConfig {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..RecoveryConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = ExecutionEngine::new(generator.clone()).with_config(&config);
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    let mut events = engine.subscribe(run_id, 0).unwrap();
    within(until(&mut events, EventKind::RunRecovering)).await;
    assert_eq!(
        engine.snapshot(run_id).await.unwrap().status,
        RunStatus::Recovering
    );

    engine.cancel(run_id).await.unwrap();
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(generator.calls_for("strategy"), 1);
    assert_eq!(
        run.step_state("strategy"),
        Some(&StepState::Skipped {
            reason: SkipReason::RunAborted
        })
    );
}

#[tokio::test]
async fn test_cancel_finished_run_is_noop() {
    let engine = engine(ScriptedGenerator::new());
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    within(engine.wait(run_id)).await.unwrap();
    engine.approve(run_id, true, Default::default()).await.unwrap();
    within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(engine.cancel(run_id).await.unwrap(), RunStatus::Completed);
    let run = engine.snapshot(run_id).await.unwrap();
    assert!(run.cause.is_none());
}

#[tokio::test]
async fn test_unknown_run() {
    let engine = engine(ScriptedGenerator::new());
    let missing = Uuid::new_v4();

    assert!(matches!(
        engine.cancel(missing).await,
        Err(EngineError::UnknownRun(id)) if id == missing
    ));
    assert!(matches!(
        engine.snapshot(missing).await,
        Err(EngineError::UnknownRun(_))
    ));
    assert!(matches!(
        engine.subscribe(missing, 0),
        Err(EngineError::UnknownRun(_))
    ));
}

#[tokio::test]
async fn test_dropping_engine_aborts_run_awaiting_review() {
    let engine = engine(ScriptedGenerator::new());
    let store = Arc::clone(engine.store());
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    let events = engine.subscribe(run_id, 0).unwrap();
    assert_eq!(
        within(engine.wait(run_id)).await.unwrap().status,
        RunStatus::AwaitingReview
    );

    drop(engine);

    let events = within(events.collect()).await;
    assert_terminal_event_last(&events);
    assert_eq!(events.last().unwrap().kind, EventKind::RunAborted);

    let run = within(settled(&store, run_id)).await;
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.cause.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(
        run.step_state("review"),
        Some(&StepState::Skipped {
            reason: SkipReason::RunAborted
        })
    );
}

#[tokio::test]
async fn test_dropping_engine_ends_pending_backoff() {
    let generator = ScriptedGenerator::new().script(
        "strategy",
        vec![Reply::Fail(GenerationError::Unavailable("down".to_string()))],
    );
    let config = EngineConfig {
        recovery: RecoveryConfig {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..RecoveryConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = ExecutionEngine::new(generator.clone()).with_config(&config);
    let store = Arc::clone(engine.store());
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    let mut events = engine.subscribe(run_id, 0).unwrap();
    within(until(&mut events, EventKind::RunRecovering)).await;

    drop(engine);

    let run = within(settled(&store, run_id)).await;
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(generator.calls_for("strategy"), 1);

    let rest = within(events.collect()).await;
    assert_eq!(rest.last().unwrap().kind, EventKind::RunAborted);
}
