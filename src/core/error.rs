//! Error taxonomy for steps, workflow definitions and run control

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Classification of a step failure, drives the recovery decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Network or service hiccup, retry-eligible
    Transient,
    /// Rate limit or quota, retried with a longer floor delay
    ResourceExhausted,
    /// Invalid input or rejected request, never retried
    Permanent,
    /// Step exceeded its deadline
    Timeout,
    /// Graph/data contract violation, fatal to the branch
    MissingInput,
    /// Cooperative stop
    Cancelled,
}

impl ErrorKind {
    /// Whether the default recovery policy may retry this kind at all
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::ResourceExhausted | ErrorKind::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single step attempt
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn missing_input(key: &str) -> Self {
        Self::new(
            ErrorKind::MissingInput,
            format!("input '{}' has not been produced", key),
        )
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("timed out after {}ms", after.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run was cancelled")
    }
}

/// Structural problems found while building a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow '{0}' has no steps")]
    Empty(String),

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cycle detected involving step '{0}'")]
    CycleDetected(String),

    #[error("step '{step}' requires input '{input}' that no predecessor or initial input provides")]
    UnsatisfiableInput { step: String, input: String },

    #[error("output '{output}' is declared by both '{first}' and '{second}'")]
    DuplicateOutput {
        output: String,
        first: String,
        second: String,
    },

    #[error("only one review gate is allowed, found '{first}' and '{second}'")]
    MultipleGates { first: String, second: String },

    #[error("review gate '{0}' cannot be a member of a parallel group")]
    GateInParallelGroup(String),

    #[error("parallel group '{group}' members do not share the same predecessors ('{step}' differs)")]
    GroupPredecessorMismatch { group: String, step: String },

    #[error("step '{step}' must declare {expected} output key(s), found {found}")]
    OutputArity {
        step: String,
        expected: &'static str,
        found: usize,
    },
}

/// Errors returned by the run control API
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown run: {0}")]
    UnknownRun(Uuid),

    #[error("run {0} has not reached a terminal status")]
    RunNotTerminal(Uuid),

    #[error("run {0} is no longer accepting control messages")]
    EngineClosed(Uuid),

    #[error("run store error: {0}")]
    Store(#[from] anyhow::Error),
}
