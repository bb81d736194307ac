//! Run events and their publication
//!
//! Every run owns an append-only, cursor-addressable event log. Events carry a
//! per-run monotonic sequence number starting at 0.

pub mod publisher;

use crate::core::context::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use publisher::{EventLog, EventPublisher, Subscription};

/// Kind of run event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StepStarted,
    /// One generated token; the only kind that may be dropped under pressure
    Token,
    StepCompleted,
    StepFailed,
    RunAwaitingReview,
    RunRecovering,
    RunCompleted,
    RunAborted,
}

impl EventKind {
    /// Control-plane events are never dropped
    pub fn is_control(&self) -> bool {
        !matches!(self, EventKind::Token)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::RunCompleted | EventKind::RunAborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StepStarted => "step_started",
            EventKind::Token => "token",
            EventKind::StepCompleted => "step_completed",
            EventKind::StepFailed => "step_failed",
            EventKind::RunAwaitingReview => "run_awaiting_review",
            EventKind::RunRecovering => "run_recovering",
            EventKind::RunCompleted => "run_completed",
            EventKind::RunAborted => "run_aborted",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published run event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: Uuid,
    pub step_id: Option<String>,
    pub kind: EventKind,
    pub payload: Payload,
    /// Per-run monotonic sequence, starting at 0
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Payload field as a string, if present
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Payload field as an unsigned integer, if present
    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(|v| v.as_u64())
    }
}
