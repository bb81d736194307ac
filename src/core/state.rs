//! Execution state models

use crate::core::{
    context::Payload,
    error::{ErrorKind, StepError},
    workflow::WorkflowDefinition,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has been created but its driver has not started
    Pending,
    /// Run is dispatching steps
    Running,
    /// Run is halted at the review gate
    AwaitingReview,
    /// At least one step is backing off before a retry
    Recovering,
    /// Every step finished without an unrecovered failure
    Completed,
    /// Run was cancelled or hit an unrecovered failure
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingReview => "awaiting_review",
            RunStatus::Recovering => "recovering",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "awaiting_review" => Ok(RunStatus::AwaitingReview),
            "recovering" => Ok(RunStatus::Recovering),
            "completed" => Ok(RunStatus::Completed),
            "aborted" => Ok(RunStatus::Aborted),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Why a step never ran (or stopped running)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Non-critical parallel branch dropped after its failure
    BranchDropped,
    /// A predecessor failed
    UpstreamFailed { step: String },
    /// The run was aborted before the step could run
    RunAborted,
}

/// State of a single step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// Step is waiting for dependencies (or for its retry delay)
    Pending,
    /// Every predecessor has finished, step is about to dispatch
    Ready,
    /// An attempt is in flight (or the gate is awaiting review)
    Running,
    Succeeded,
    /// Step failed and was not recovered
    Failed,
    Skipped { reason: SkipReason },
}

impl StepState {
    /// Check if step is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Skipped { .. }
        )
    }

    /// Whether successors may treat this step as satisfied
    pub fn unblocks_successors(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded
                | StepState::Skipped {
                    reason: SkipReason::BranchDropped
                }
        )
    }

    /// Whether successors must be skipped because of this step
    pub fn poisons_successors(&self) -> bool {
        matches!(
            self,
            StepState::Failed
                | StepState::Skipped {
                    reason: SkipReason::UpstreamFailed { .. } | SkipReason::RunAborted
                }
        )
    }
}

/// Per-step execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub state: StepState,

    /// Attempts started so far
    pub attempts: u32,

    /// Start of the most recent attempt
    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for StepRecord {
    fn default() -> Self {
        Self {
            state: StepState::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// One failed attempt, as recorded in the run's error log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: String,
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StepFailure {
    pub fn new(step_id: impl Into<String>, attempt: u32, error: &StepError) -> Self {
        Self {
            step_id: step_id.into(),
            attempt,
            kind: error.kind,
            message: error.message.clone(),
            at: Utc::now(),
        }
    }

    pub fn error(&self) -> StepError {
        StepError::new(self.kind, self.message.clone())
    }
}

/// Why a run was aborted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortCause {
    /// Failing step; `None` when the run was cancelled
    pub step_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl AbortCause {
    pub fn cancelled() -> Self {
        let error = StepError::cancelled();
        Self {
            step_id: None,
            kind: error.kind,
            message: error.message,
            at: Utc::now(),
        }
    }
}

impl From<&StepFailure> for AbortCause {
    fn from(failure: &StepFailure) -> Self {
        Self {
            step_id: Some(failure.step_id.clone()),
            kind: failure.kind,
            message: failure.message.clone(),
            at: failure.at,
        }
    }
}

/// Human reviewer's verdict at the gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub step_id: String,
    pub approved: bool,
    pub annotations: Payload,
    pub decided_at: DateTime<Utc>,
}

/// Execution state of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run ID
    pub run_id: Uuid,

    pub workflow: String,

    /// Inputs supplied at submission
    pub inputs: Payload,

    /// Step records keyed by step id
    pub steps: BTreeMap<String, StepRecord>,

    /// Merged outputs of succeeded steps
    pub outputs: Payload,

    pub status: RunStatus,

    /// Every failed attempt, in order
    pub error_log: Vec<StepFailure>,

    /// First unrecovered error (or cancellation), set when the run aborts
    pub cause: Option<AbortCause>,

    pub review: Option<ReviewDecision>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Create a run with every step Pending
    pub fn new(workflow: &WorkflowDefinition, inputs: Payload) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            workflow: workflow.name.clone(),
            inputs,
            steps: workflow
                .steps()
                .map(|s| (s.id.clone(), StepRecord::default()))
                .collect(),
            outputs: Payload::new(),
            status: RunStatus::Pending,
            error_log: Vec::new(),
            cause: None,
            review: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    pub fn step_state(&self, id: &str) -> Option<&StepState> {
        self.steps.get(id).map(|r| &r.state)
    }

    /// Move a step to a new state, stamping terminal transitions
    pub fn set_state(&mut self, id: &str, state: StepState) {
        let now = Utc::now();
        if let Some(record) = self.steps.get_mut(id) {
            if state.is_terminal() {
                record.finished_at = Some(now);
            }
            record.state = state;
        }
        self.updated_at = now;
    }

    /// Count a new attempt and mark the step Running
    pub fn begin_attempt(&mut self, id: &str) -> u32 {
        let now = Utc::now();
        let attempt = match self.steps.get_mut(id) {
            Some(record) => {
                record.attempts += 1;
                record.state = StepState::Running;
                record.started_at = Some(now);
                record.attempts
            }
            None => 0,
        };
        self.updated_at = now;
        attempt
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Append a failed attempt to the error log
    pub fn record_failure(&mut self, failure: StepFailure) {
        self.error_log.push(failure);
        self.updated_at = Utc::now();
    }

    /// Previous failures of one step, oldest first
    pub fn failures_of<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepFailure> {
        self.error_log.iter().filter(move |f| f.step_id == step_id)
    }

    /// Calculate progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self.steps.values().filter(|r| r.state.is_terminal()).count();
        done as f64 / self.steps.len() as f64
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
