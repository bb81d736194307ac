//! Step context - the input bag handed to a running step

use crate::core::{error::StepError, step::StepDefinition};
use serde_json::{Map, Value};

/// Opaque key-value bag used for run inputs, step outputs and event payloads
pub type Payload = Map<String, Value>;

/// Build a payload from `(key, value)` pairs
pub fn payload<I, K>(entries: I) -> Payload
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Execution context for one step attempt
///
/// Holds exactly the keys the step declared, resolved from the run's merged
/// outputs first and its initial inputs second.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub step_id: String,
    pub attempt: u32,
    pub values: Payload,
}

impl StepContext {
    /// Resolve a step's declared inputs
    ///
    /// Fails with `MissingInput` on the first required key that is absent.
    pub fn resolve(
        step: &StepDefinition,
        attempt: u32,
        inputs: &Payload,
        outputs: &Payload,
    ) -> Result<Self, StepError> {
        let lookup = |key: &str| outputs.get(key).or_else(|| inputs.get(key)).cloned();

        let mut values = Payload::new();
        for key in &step.inputs {
            let value = lookup(key).ok_or_else(|| StepError::missing_input(key))?;
            values.insert(key.clone(), value);
        }
        for key in &step.optional_inputs {
            if let Some(value) = lookup(key) {
                values.insert(key.clone(), value);
            }
        }

        Ok(Self {
            step_id: step.id.clone(),
            attempt,
            values,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}
