//! Workflow execution: engine, step executor, scheduling and recovery

pub mod engine;
pub mod executor;
pub mod recovery;
pub mod scheduler;

pub use engine::ExecutionEngine;
pub use executor::{EventTokenSink, StepExecutor};
pub use recovery::{Decision, DefaultRecoveryPolicy, RecoveryPolicy};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
