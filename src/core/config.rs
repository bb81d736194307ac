//! Workflow configuration from YAML

use crate::core::{
    context::Payload,
    registry::StepRegistry,
    step::{Capability, StepDefinition},
    transform::TransformKind,
    workflow::WorkflowDefinition,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level workflow configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Initial input keys a run expects
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Values used for initial inputs the caller does not supply
    #[serde(default)]
    pub defaults: Payload,

    /// Workflow steps
    pub steps: Vec<StepConfig>,

    /// Engine tuning (event log capacity, step defaults, backoff)
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Step configuration as defined in YAML
///
/// Exactly one of `generate`, `transform` or `review_gate` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step identifier
    pub id: String,

    /// Human-readable step name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub optional_inputs: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,

    /// List of step IDs this step depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub generate: Option<GenerateConfig>,

    /// Written as a single-key map, e.g. `allocate_budget: { channels: [..] }`
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub transform: Option<TransformKind>,

    #[serde(default)]
    pub review_gate: Option<ReviewGateConfig>,

    /// Maximum retries for this step (overrides engine default)
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Timeout for this step (overrides engine default; the gate has none unless set)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub parallel_group: Option<String>,

    #[serde(default)]
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// Prompt template with `{{ key }}` placeholders
    pub prompt: String,

    /// Extra parameters passed through to the generation service
    #[serde(default)]
    pub parameters: Payload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewGateConfig {
    /// Shown to the reviewer
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Events retained per run before token events are evicted
    pub event_capacity: usize,

    /// Default step timeout (in seconds)
    pub default_timeout_secs: u64,

    /// Default retries after the first attempt
    pub default_max_retries: u32,

    /// Upper bound on concurrently running steps (unbounded when unset)
    pub max_concurrent_steps: Option<usize>,

    pub recovery: RecoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            default_timeout_secs: 300,
            default_max_retries: 3,
            max_concurrent_steps: None,
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Backoff settings for the default recovery policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Delay before the first retry
    pub base_delay_ms: u64,

    /// Upper bound for any retry delay
    pub max_delay_ms: u64,

    /// Minimum delay after a rate-limit or quota failure
    pub resource_exhausted_floor_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            resource_exhausted_floor_ms: 5_000,
        }
    }
}

impl RecoveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn resource_exhausted_floor(&self) -> Duration {
        Duration::from_millis(self.resource_exhausted_floor_ms)
    }
}

impl WorkflowConfig {
    /// Load workflow configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse workflow configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check each step declares exactly one capability
    ///
    /// Graph-level rules are enforced by `to_definition`.
    pub fn validate(&self) -> Result<()> {
        for step in &self.steps {
            step.capability()?;
        }
        for key in self.defaults.keys() {
            if !self.inputs.contains(key) {
                anyhow::bail!("Default given for undeclared input '{}'", key);
            }
        }
        Ok(())
    }

    /// Convert config to a validated workflow definition
    pub fn to_definition(&self) -> Result<WorkflowDefinition> {
        let mut registry = StepRegistry::new();
        for step in &self.steps {
            registry.register(step.to_step(&self.engine)?)?;
        }

        let mut definition = WorkflowDefinition::new(&self.name, registry, self.inputs.clone())?;
        definition.description = self.description.clone();
        Ok(definition)
    }

    /// Merge caller-supplied inputs over the configured defaults
    pub fn initial_inputs(&self, supplied: Payload) -> Payload {
        let mut inputs = self.defaults.clone();
        inputs.extend(supplied);
        inputs
    }
}

impl StepConfig {
    fn capability(&self) -> Result<Capability> {
        let declared = [
            self.generate.is_some(),
            self.transform.is_some(),
            self.review_gate.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if declared != 1 {
            anyhow::bail!(
                "Step '{}' must declare exactly one of generate, transform or review_gate (found {})",
                self.id,
                declared
            );
        }

        let capability = if let Some(generate) = &self.generate {
            Capability::Generate {
                prompt: generate.prompt.clone(),
                parameters: generate.parameters.clone(),
            }
        } else if let Some(transform) = &self.transform {
            Capability::Transform(transform.clone())
        } else {
            Capability::ReviewGate {
                prompt: self.review_gate.as_ref().and_then(|g| g.prompt.clone()),
            }
        };
        Ok(capability)
    }

    /// Build the step definition, applying engine defaults
    pub fn to_step(&self, engine: &EngineConfig) -> Result<StepDefinition> {
        let capability = self.capability()?;
        let is_gate = capability.is_gate();

        let mut step = StepDefinition::new(&self.id, capability);
        step.name = self.name.clone();
        step.inputs = self.inputs.clone();
        step.optional_inputs = self.optional_inputs.clone();
        step.outputs = self.outputs.clone();
        step.depends_on = self.depends_on.clone();
        step.parallel_group = self.parallel_group.clone();
        step.critical = self.critical;
        step.max_retries = self.max_retries.unwrap_or(engine.default_max_retries);
        step.timeout = match self.timeout_secs {
            Some(secs) => Some(Duration::from_secs(secs)),
            None if is_gate => None,
            None => Some(Duration::from_secs(engine.default_timeout_secs)),
        };
        Ok(step)
    }
}
