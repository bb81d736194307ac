//! Recovery policy - decides what happens after a failed attempt

use crate::core::{
    config::RecoveryConfig,
    error::{ErrorKind, StepError},
    state::StepFailure,
    step::StepDefinition,
};
use std::time::Duration;

/// Outcome of a recovery decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the step again after the delay
    Retry(Duration),
    /// Drop the branch; successors treat the step as satisfied
    Skip,
    /// Give up on the step
    Abort,
}

/// Pure decision function consulted after every failed attempt
pub trait RecoveryPolicy: Send + Sync {
    /// Decide for `step` after `error` on `attempt` (1-based)
    ///
    /// `history` holds the step's earlier failures, oldest first, and does
    /// not include the current one.
    fn decide(
        &self,
        step: &StepDefinition,
        attempt: u32,
        error: &StepError,
        history: &[StepFailure],
    ) -> Decision;
}

/// Classified retries with capped exponential backoff
///
/// With the default configuration the first retry waits 500ms, then 1s, 2s,
/// and so on up to 30s. Rate-limited attempts wait at least 5s.
#[derive(Debug, Clone, Default)]
pub struct DefaultRecoveryPolicy {
    config: RecoveryConfig,
}

impl DefaultRecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// Capped exponential delay for a 1-based attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.config
            .base_delay()
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_delay())
    }

    fn retry_delay(&self, attempt: u32, kind: ErrorKind) -> Duration {
        let delay = self.backoff(attempt);
        match kind {
            ErrorKind::ResourceExhausted => delay.max(self.config.resource_exhausted_floor()),
            _ => delay,
        }
    }

    /// Whether the failure may be retried at all, ignoring the retry budget
    fn is_retryable(&self, attempt: u32, error: &StepError, history: &[StepFailure]) -> bool {
        match error.kind {
            ErrorKind::Transient | ErrorKind::ResourceExhausted => true,
            // A second consecutive timeout is treated as non-retryable
            ErrorKind::Timeout => !history
                .last()
                .is_some_and(|prev| prev.kind == ErrorKind::Timeout && prev.attempt + 1 == attempt),
            ErrorKind::Permanent | ErrorKind::MissingInput | ErrorKind::Cancelled => false,
        }
    }
}

impl RecoveryPolicy for DefaultRecoveryPolicy {
    fn decide(
        &self,
        step: &StepDefinition,
        attempt: u32,
        error: &StepError,
        history: &[StepFailure],
    ) -> Decision {
        if error.kind == ErrorKind::Cancelled {
            return Decision::Abort;
        }

        if attempt <= step.max_retries && self.is_retryable(attempt, error, history) {
            return Decision::Retry(self.retry_delay(attempt, error.kind));
        }

        if step.parallel_group.is_some() && !step.critical {
            Decision::Skip
        } else {
            Decision::Abort
        }
    }
}
