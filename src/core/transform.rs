//! Built-in pure transforms

use crate::core::{
    context::{Payload, StepContext},
    error::StepError,
    step::render_template,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Closed set of synchronous data transforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Render a `{{ key }}` template from the step inputs
    Template { template: String },

    /// Collect every present input into a single object
    Merge,

    /// Split a budget evenly across channels
    AllocateBudget {
        /// Falls back to the numeric `budget` input when absent
        #[serde(default)]
        total: Option<f64>,
        channels: Vec<String>,
    },
}

impl TransformKind {
    /// Apply the transform, producing the value for the step's single output
    pub fn apply(&self, ctx: &StepContext) -> Result<Value, StepError> {
        match self {
            TransformKind::Template { template } => {
                Ok(Value::String(render_template(template, &ctx.values)))
            }
            TransformKind::Merge => Ok(Value::Object(ctx.values.clone())),
            TransformKind::AllocateBudget { total, channels } => {
                allocate_budget(*total, channels, &ctx.values)
            }
        }
    }
}

fn allocate_budget(
    total: Option<f64>,
    channels: &[String],
    values: &Payload,
) -> Result<Value, StepError> {
    if channels.is_empty() {
        return Err(StepError::permanent("no channels to allocate budget to"));
    }

    let total = match total {
        Some(total) => total,
        None => values
            .get("budget")
            .and_then(Value::as_f64)
            .ok_or_else(|| StepError::permanent("budget is not configured or not numeric"))?,
    };
    if total < 0.0 {
        return Err(StepError::permanent(format!("negative budget: {}", total)));
    }

    let share = total / channels.len() as f64;
    let allocation: Payload = channels
        .iter()
        .map(|channel| (channel.clone(), json!(share)))
        .collect();

    Ok(Value::Object(allocation))
}
