//! Test: parallel groups dispatch together and fail independently

use crate::helpers::*;
use adflow::core::{payload, RunStatus, SkipReason, StepDefinition, StepState, WorkflowDefinition};
use adflow::events::EventKind;
use adflow::generation::GenerationError;
use adflow::{ErrorKind, SchedulingStrategy};
use serde_json::json;
use std::time::Duration;

/// strategy -> [facebook, instagram] -> summary
fn fan_out(critical_facebook: bool) -> WorkflowDefinition {
    WorkflowDefinition::builder("fan-out")
        .input("brief")
        .step(
            StepDefinition::generate("strategy", "Plan {{ brief }}")
                .with_inputs(&["brief"])
                .with_outputs(&["strategy"]),
        )
        .step(
            StepDefinition::generate("facebook", "FB {{ strategy }}")
                .with_inputs(&["strategy"])
                .with_outputs(&["content_facebook"])
                .depends_on(&["strategy"])
                .in_group("content")
                .critical(critical_facebook),
        )
        .step(
            StepDefinition::generate("instagram", "IG {{ strategy }}")
                .with_inputs(&["strategy"])
                .with_outputs(&["content_instagram"])
                .depends_on(&["strategy"])
                .in_group("content"),
        )
        .step(
            StepDefinition::generate("summary", "Summarise")
                .with_optional_inputs(&["content_facebook", "content_instagram"])
                .with_outputs(&["summary"])
                .depends_on(&["facebook", "instagram"]),
        )
        .build()
        .unwrap()
}

/// brief -> [a, b, c] -> report, with `a` optionally critical
fn trio(critical_a: bool) -> WorkflowDefinition {
    let member = |id: &str| {
        let output = format!("variant_{}", id);
        StepDefinition::generate(id, "Variant {{ brief }}")
            .with_inputs(&["brief"])
            .with_outputs(&[output.as_str()])
            .in_group("variants")
    };
    WorkflowDefinition::builder("trio")
        .input("brief")
        .step(member("a").critical(critical_a))
        .step(member("b"))
        .step(member("c"))
        .step(
            StepDefinition::generate("report", "Report")
                .with_optional_inputs(&["variant_a", "variant_b", "variant_c"])
                .with_outputs(&["report"])
                .depends_on(&["a", "b", "c"]),
        )
        .build()
        .unwrap()
}

fn flaky(times: usize) -> Vec<Reply> {
    (0..times)
        .map(|_| Reply::Fail(GenerationError::Unavailable("connection reset".to_string())))
        .collect()
}

fn brief() -> adflow::Payload {
    payload([("brief", json!("spring sale"))])
}

#[tokio::test]
async fn test_group_members_run_concurrently() {
    // Both members must be in flight at once to get past the barrier
    let generator = ScriptedGenerator::new().rendezvous(&["facebook", "instagram"]);
    let engine = engine(generator.clone());
    let (workflow, inputs) = campaign();

    let run_id = engine.submit(workflow, inputs).await.unwrap();
    let run = within(engine.wait(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::AwaitingReview);
    assert_eq!(generator.max_concurrency(), 2);
}

#[tokio::test]
async fn test_sequential_strategy_runs_one_step_at_a_time() {
    let slow = |text: &str| vec![Reply::Slow(Duration::from_millis(20), text.to_string())];
    let generator = ScriptedGenerator::new()
        .script("facebook", slow("fb"))
        .script("instagram", slow("ig"));
    let engine = engine(generator.clone()).with_strategy(SchedulingStrategy::Sequential);

    let run_id = engine.submit(fan_out(false), brief()).await.unwrap();
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(generator.max_concurrency(), 1);
    assert_eq!(generator.calls().len(), 4);
}

#[tokio::test]
async fn test_non_critical_member_failure_drops_branch() {
    let generator = ScriptedGenerator::new().script(
        "instagram",
        vec![Reply::Fail(GenerationError::Rejected(
            "policy violation".to_string(),
        ))],
    );
    let engine = engine(generator.clone());

    let run_id = engine.submit(fan_out(false), brief()).await.unwrap();
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.step_state("instagram"),
        Some(&StepState::Skipped {
            reason: SkipReason::BranchDropped
        })
    );
    assert_eq!(run.step_state("summary"), Some(&StepState::Succeeded));
    assert!(run.outputs.contains_key("content_facebook"));
    assert!(!run.outputs.contains_key("content_instagram"));
    assert_eq!(error_kinds(&run, "instagram"), vec![ErrorKind::Permanent]);
    assert_eq!(generator.calls_for("instagram"), 1);

    let events = events_of(&engine, run_id).await;
    let failed = events_for(&events, "instagram", EventKind::StepFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["will_retry"], json!(false));
    assert_eq!(events.last().unwrap().kind, EventKind::RunCompleted);
}

#[tokio::test]
async fn test_critical_member_failure_cancels_siblings() {
    let generator = ScriptedGenerator::new()
        .script(
            "facebook",
            vec![Reply::Fail(GenerationError::Rejected("unsafe".to_string()))],
        )
        .script("instagram", vec![Reply::Hang]);
    let engine = engine(generator);

    let run_id = engine.submit(fan_out(true), brief()).await.unwrap();
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    let cause = run.cause.clone().unwrap();
    assert_eq!(cause.step_id.as_deref(), Some("facebook"));
    assert_eq!(cause.kind, ErrorKind::Permanent);

    assert_eq!(run.step_state("facebook"), Some(&StepState::Failed));
    assert_eq!(run.step_state("instagram"), Some(&StepState::Failed));
    assert_eq!(error_kinds(&run, "instagram"), vec![ErrorKind::Cancelled]);
    assert_eq!(
        run.step_state("summary"),
        Some(&StepState::Skipped {
            reason: SkipReason::RunAborted
        })
    );
    // Committed outputs survive the abort
    assert!(run.outputs.contains_key("strategy"));

    let events = events_of(&engine, run_id).await;
    assert_terminal_event_last(&events);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::RunAborted);
    assert_eq!(last.field_str("step"), Some("facebook"));
}

#[tokio::test]
async fn test_critical_member_exhausting_retries_cancels_both_siblings() {
    let generator = ScriptedGenerator::new()
        .script("a", flaky(4))
        .script("b", vec![Reply::Hang])
        .script("c", vec![Reply::Hang]);
    let engine = engine(generator.clone());

    let run_id = engine.submit(trio(true), brief()).await.unwrap();
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    let cause = run.cause.clone().unwrap();
    assert_eq!(cause.step_id.as_deref(), Some("a"));
    assert_eq!(cause.kind, ErrorKind::Transient);
    assert_eq!(generator.calls_for("a"), 4);

    for sibling in ["b", "c"] {
        assert_eq!(run.step_state(sibling), Some(&StepState::Failed));
        assert_eq!(error_kinds(&run, sibling), vec![ErrorKind::Cancelled]);
    }
    assert_eq!(
        run.step_state("report"),
        Some(&StepState::Skipped {
            reason: SkipReason::RunAborted
        })
    );

    let events = events_of(&engine, run_id).await;
    assert_terminal_event_last(&events);
    assert_eq!(events_for(&events, "a", EventKind::StepStarted).len(), 4);
}

#[tokio::test]
async fn test_non_critical_member_exhausting_retries_is_dropped() {
    let generator = ScriptedGenerator::new().script("a", flaky(4));
    let engine = engine(generator.clone());

    let run_id = engine.submit(trio(false), brief()).await.unwrap();
    let run = within(engine.wait_for_terminal(run_id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.cause.is_none());
    assert_eq!(
        run.step_state("a"),
        Some(&StepState::Skipped {
            reason: SkipReason::BranchDropped
        })
    );
    assert_eq!(run.step_state("b"), Some(&StepState::Succeeded));
    assert_eq!(run.step_state("c"), Some(&StepState::Succeeded));
    assert_eq!(run.step_state("report"), Some(&StepState::Succeeded));
    assert_eq!(error_kinds(&run, "a"), vec![ErrorKind::Transient; 4]);
    assert!(!run.outputs.contains_key("variant_a"));
    assert!(run.outputs.contains_key("variant_b"));
    assert!(run.outputs.contains_key("variant_c"));

    let events = events_of(&engine, run_id).await;
    assert_eq!(count_kind(&events, EventKind::RunRecovering), 3);
    assert_eq!(events.last().unwrap().kind, EventKind::RunCompleted);
}
