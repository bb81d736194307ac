//! Step registry - id-indexed, insertion-ordered step definitions

use crate::core::{error::ValidationError, step::StepDefinition};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered steps of one workflow
///
/// Registration is the only mutation; once handed to a `WorkflowDefinition`
/// the registry is shared read-only.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    order: Vec<String>,
    steps: HashMap<String, Arc<StepDefinition>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step, rejecting duplicate identifiers
    pub fn register(&mut self, step: StepDefinition) -> Result<(), ValidationError> {
        if self.steps.contains_key(&step.id) {
            return Err(ValidationError::DuplicateStep(step.id));
        }
        self.order.push(step.id.clone());
        self.steps.insert(step.id.clone(), Arc::new(step));
        Ok(())
    }

    /// Register several steps in order
    pub fn register_all<I>(&mut self, steps: I) -> Result<(), ValidationError>
    where
        I: IntoIterator<Item = StepDefinition>,
    {
        for step in steps {
            self.register(step)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<StepDefinition>> {
        self.steps.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    /// Steps in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<StepDefinition>> {
        self.order.iter().filter_map(|id| self.steps.get(id))
    }

    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
