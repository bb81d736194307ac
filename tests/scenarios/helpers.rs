//! Test utilities: a scripted generation service and run inspection helpers

use adflow::core::config::{EngineConfig, RecoveryConfig, WorkflowConfig};
use adflow::core::{payload, Payload, Run, WorkflowDefinition};
use adflow::events::{Event, EventKind};
use adflow::generation::{Generation, GenerationError, GenerationRequest, GenerationService};
use adflow::ExecutionEngine;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;
use uuid::Uuid;

/// What the generator does for one call
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(GenerationError),
    /// Reply after a delay
    Slow(Duration, String),
    /// Never reply; only cancellation ends the attempt
    Hang,
}

/// Generation stub answering from per-step scripts
///
/// Steps without a script (or with an exhausted one) echo their prompt.
#[derive(Clone, Default)]
pub struct ScriptedGenerator {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Reply>>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
    barrier: Option<(Arc<Barrier>, Arc<HashSet<String>>)>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for a step, consumed one per attempt
    pub fn script(self, step_id: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(step_id.to_string(), replies.into());
        self
    }

    /// Make the listed steps meet at a barrier before answering
    pub fn rendezvous(mut self, step_ids: &[&str]) -> Self {
        let members: HashSet<String> = step_ids.iter().map(|s| s.to_string()).collect();
        self.barrier = Some((Arc::new(Barrier::new(members.len())), Arc::new(members)));
        self
    }

    /// `(step_id, prompt)` of every call, in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, step_id: &str) -> usize {
        self.calls().iter().filter(|(id, _)| id == step_id).count()
    }

    /// Highest number of calls that were in progress at once
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &GenerationRequest) -> Reply {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&request.step_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Reply::Text(format!("{} -> {}", request.step_id, request.prompt)))
    }

    async fn answer(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        if let Some((barrier, members)) = &self.barrier {
            if members.contains(&request.step_id) {
                barrier.wait().await;
            }
        }

        match self.next_reply(request) {
            Reply::Text(text) => Ok(Generation::new(text)),
            Reply::Fail(err) => Err(err),
            Reply::Slow(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(Generation::new(text))
            }
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Decrements the active-call counter when an attempt ends or is dropped
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.step_id.clone(), request.prompt.clone()));

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(Arc::clone(&self.active));
        self.max_active.fetch_max(now, Ordering::SeqCst);

        self.answer(request).await
    }
}

pub const CAMPAIGN: &str = r#"
name: "campaign"
description: "Strategy, per-channel copy, review, budget"
inputs: [objective, audience, budget]
defaults:
  budget: 1000

steps:
  - id: strategy
    inputs: [objective, audience]
    outputs: [strategy]
    critical: true
    generate:
      prompt: "Plan a campaign to {{ objective }} for {{ audience }}"

  - id: facebook
    depends_on: [strategy]
    inputs: [strategy]
    outputs: [content_facebook]
    parallel_group: content
    generate:
      prompt: "Facebook ad for {{ strategy }}"

  - id: instagram
    depends_on: [strategy]
    inputs: [strategy]
    outputs: [content_instagram]
    parallel_group: content
    generate:
      prompt: "Instagram ad for {{ strategy }}"

  - id: review
    depends_on: [facebook, instagram]
    optional_inputs: [content_facebook, content_instagram]
    outputs: [review]
    review_gate:
      prompt: "Approve the generated ads?"

  - id: budget
    depends_on: [review]
    inputs: [budget]
    outputs: [allocation]
    transform:
      allocate_budget:
        channels: [facebook, instagram]
"#;

/// The campaign workflow and its initial inputs
pub fn campaign() -> (WorkflowDefinition, Payload) {
    let config = WorkflowConfig::from_yaml(CAMPAIGN).unwrap();
    let inputs = config.initial_inputs(payload([
        ("objective", json!("launch the spring collection")),
        ("audience", json!("young professionals")),
    ]));
    (config.to_definition().unwrap(), inputs)
}

/// Engine settings with millisecond backoff
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        recovery: RecoveryConfig {
            base_delay_ms: 10,
            max_delay_ms: 80,
            resource_exhausted_floor_ms: 40,
        },
        ..EngineConfig::default()
    }
}

pub fn engine(generator: ScriptedGenerator) -> ExecutionEngine<ScriptedGenerator> {
    ExecutionEngine::new(generator).with_config(&fast_config())
}

/// The complete event log of a finished run
pub async fn events_of(engine: &ExecutionEngine<ScriptedGenerator>, run_id: Uuid) -> Vec<Event> {
    engine.subscribe(run_id, 0).unwrap().collect().await
}

/// Events of one kind for one step
pub fn events_for<'a>(events: &'a [Event], step_id: &str, kind: EventKind) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|e| e.kind == kind && e.step_id.as_deref() == Some(step_id))
        .collect()
}

pub fn count_kind(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

/// Sequence of the step's first event of `kind`
pub fn first_sequence(events: &[Event], step_id: &str, kind: EventKind) -> Option<u64> {
    events_for(events, step_id, kind).first().map(|e| e.sequence)
}

pub fn assert_terminal_event_last(events: &[Event]) {
    let last = events.last().expect("run produced no events");
    assert!(last.kind.is_terminal(), "last event was {:?}", last.kind);
    assert_eq!(
        events.iter().filter(|e| e.kind.is_terminal()).count(),
        1,
        "exactly one terminal event"
    );
}

pub fn error_kinds(run: &Run, step_id: &str) -> Vec<adflow::ErrorKind> {
    run.failures_of(step_id).map(|f| f.kind).collect()
}

/// Bound every scenario so a scheduling bug fails instead of hanging
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("scenario timed out")
}
