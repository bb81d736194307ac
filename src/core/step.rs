//! Step domain model

use crate::core::{context::Payload, transform::TransformKind};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

/// How a step is executed
#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    /// Call the external generation service with a rendered prompt
    Generate { prompt: String, parameters: Payload },
    /// Pure, synchronous data transform
    Transform(TransformKind),
    /// Suspend the run until a reviewer approves or rejects
    ReviewGate { prompt: Option<String> },
}

impl Capability {
    pub fn is_gate(&self) -> bool {
        matches!(self, Capability::ReviewGate { .. })
    }
}

/// A single unit of work in a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    /// Unique step identifier
    pub id: String,

    /// Human-readable name
    pub name: Option<String>,

    /// Keys that must be present before the step may run
    pub inputs: Vec<String>,

    /// Keys passed through when present
    pub optional_inputs: Vec<String>,

    /// Keys merged into the run outputs on success
    pub outputs: Vec<String>,

    /// List of step IDs this step depends on
    pub depends_on: Vec<String>,

    pub capability: Capability,

    /// Deadline for a single attempt (None = unbounded)
    pub timeout: Option<Duration>,

    /// Retries after the first attempt
    pub max_retries: u32,

    pub parallel_group: Option<String>,

    /// Exhaustion aborts the whole run
    pub critical: bool,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, capability: Capability) -> Self {
        let defaults = StepDefaults::default();
        let timeout = if capability.is_gate() {
            None
        } else {
            Some(defaults.timeout)
        };
        Self {
            id: id.into(),
            name: None,
            inputs: Vec::new(),
            optional_inputs: Vec::new(),
            outputs: Vec::new(),
            depends_on: Vec::new(),
            capability,
            timeout,
            max_retries: defaults.max_retries,
            parallel_group: None,
            critical: false,
        }
    }

    pub fn generate(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            id,
            Capability::Generate {
                prompt: prompt.into(),
                parameters: Payload::new(),
            },
        )
    }

    pub fn transform(id: impl Into<String>, kind: TransformKind) -> Self {
        Self::new(id, Capability::Transform(kind))
    }

    pub fn review_gate(id: impl Into<String>) -> Self {
        Self::new(id, Capability::ReviewGate { prompt: None })
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_optional_inputs(mut self, inputs: &[&str]) -> Self {
        self.optional_inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, steps: &[&str]) -> Self {
        self.depends_on = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn is_gate(&self) -> bool {
        self.capability.is_gate()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Render `{{ key }}` placeholders from a payload
///
/// Strings are inserted as-is, other values as compact JSON. Unknown
/// placeholders are left untouched.
pub fn render_template(template: &str, values: &Payload) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
    });

    placeholder
        .replace_all(template, |caps: &Captures| match values.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Defaults applied to steps that do not set their own limits
#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}
