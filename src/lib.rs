//! adflow - workflow orchestration for multi-step ad content generation

pub mod cli;
pub mod core;
pub mod events;
pub mod execution;
pub mod generation;
pub mod persistence;

// Re-export commonly used types
pub use core::config::{EngineConfig, WorkflowConfig};
pub use core::{
    Capability, EngineError, ErrorKind, Payload, Run, RunStatus, StepDefinition, StepError,
    StepRegistry, StepState, ValidationError, WorkflowDefinition,
};
pub use events::{Event, EventKind, Subscription};
pub use execution::{ExecutionEngine, RecoveryPolicy, SchedulingStrategy};
pub use generation::{CommandGenerator, GenerationService, GeneratorConfig};
pub use persistence::{InMemoryRunStore, RunStore};
