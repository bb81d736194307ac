//! Execution scheduler - determines which steps to run next

use crate::core::{Run, SkipReason, StepState, WorkflowDefinition};
use std::collections::HashSet;

/// Strategy for scheduling step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute steps in dependency order, one at a time
    Sequential,

    /// Execute all ready steps concurrently
    #[default]
    Parallel,

    /// Limited parallelism (max N concurrent steps)
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// `None` means unbounded
    pub fn from_limit(limit: Option<usize>) -> Self {
        match limit {
            None => SchedulingStrategy::Parallel,
            Some(0) | Some(1) => SchedulingStrategy::Sequential,
            Some(n) => SchedulingStrategy::LimitedParallel(n),
        }
    }
}

/// Scheduler for determining which steps to run
#[derive(Debug, Clone, Default)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    /// Skip every waiting step that sits below a failure
    ///
    /// Walks the topological order once, so skips cascade to all
    /// descendants. Returns `(skipped step, failed root)` pairs.
    pub fn propagate_failures(
        &self,
        workflow: &WorkflowDefinition,
        run: &mut Run,
    ) -> Vec<(String, String)> {
        let mut skipped = Vec::new();

        for step_id in workflow.execution_order() {
            let waiting = matches!(
                run.step_state(step_id),
                Some(StepState::Pending | StepState::Ready)
            );
            if !waiting {
                continue;
            }

            let root = workflow
                .predecessors(step_id)
                .iter()
                .find_map(|pred| {
                    let state = run.step_state(pred).filter(|s| s.poisons_successors())?;
                    match state {
                        StepState::Skipped {
                            reason: SkipReason::UpstreamFailed { step },
                        } => Some(step.clone()),
                        _ => Some(pred.clone()),
                    }
                });

            if let Some(root) = root {
                run.set_state(
                    step_id,
                    StepState::Skipped {
                        reason: SkipReason::UpstreamFailed { step: root.clone() },
                    },
                );
                skipped.push((step_id.clone(), root));
            }
        }

        skipped
    }

    /// Every step that may run now, in topological order
    ///
    /// A step is ready when it is already `Ready`, or when it is `Pending`,
    /// not waiting out a retry delay, and all its predecessors succeeded or
    /// were dropped as non-critical branches.
    pub fn ready_steps(
        &self,
        workflow: &WorkflowDefinition,
        run: &Run,
        backing_off: &HashSet<String>,
    ) -> Vec<String> {
        workflow
            .execution_order()
            .iter()
            .filter(|step_id| match run.step_state(step_id) {
                Some(StepState::Ready) => true,
                Some(StepState::Pending) => {
                    !backing_off.contains(*step_id)
                        && workflow.predecessors(step_id).iter().all(|pred| {
                            run.step_state(pred)
                                .is_some_and(StepState::unblocks_successors)
                        })
                }
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Ready steps the strategy allows to start, given `in_flight` running attempts
    pub fn next_steps(&self, ready: &[String], in_flight: usize) -> Vec<String> {
        let allowed = match self.strategy {
            SchedulingStrategy::Sequential => 1usize.saturating_sub(in_flight),
            SchedulingStrategy::Parallel => ready.len(),
            SchedulingStrategy::LimitedParallel(max) => max.saturating_sub(in_flight),
        };

        ready.iter().take(allowed).cloned().collect()
    }
}
