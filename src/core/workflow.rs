//! Workflow definition - a validated DAG of steps
//!
//! A `WorkflowDefinition` can only be obtained through validation, so every
//! run references a graph that is acyclic, has resolvable dependencies and
//! satisfiable inputs, and carries at most one review gate.

use crate::core::{
    error::ValidationError,
    registry::StepRegistry,
    step::{Capability, StepDefinition},
};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// A validated workflow graph
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    /// Workflow name
    pub name: String,

    pub description: Option<String>,

    /// Keys a caller is expected to provide at submission
    pub initial_inputs: Vec<String>,

    registry: StepRegistry,

    /// Step execution order (topological sort)
    topo_order: Vec<String>,

    predecessors: HashMap<String, Vec<String>>,
    successors: HashMap<String, Vec<String>>,
    groups: BTreeMap<String, Vec<String>>,
    gate: Option<String>,
}

impl WorkflowDefinition {
    /// Validate a registry of steps into a workflow definition
    pub fn new(
        name: impl Into<String>,
        registry: StepRegistry,
        initial_inputs: Vec<String>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if registry.is_empty() {
            return Err(ValidationError::Empty(name));
        }

        let topo_order = Self::topological_sort(&registry)?;

        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        for step in registry.iter() {
            predecessors.insert(step.id.clone(), step.depends_on.clone());
            successors.entry(step.id.clone()).or_default();
            for dep in &step.depends_on {
                successors.entry(dep.clone()).or_default().push(step.id.clone());
            }
        }

        let gate = Self::find_gate(&registry)?;
        let groups = Self::collect_groups(&registry)?;
        Self::check_outputs(&registry)?;
        Self::check_inputs(&registry, &topo_order, &initial_inputs)?;

        Ok(Self {
            name,
            description: None,
            initial_inputs,
            registry,
            topo_order,
            predecessors,
            successors,
            groups,
            gate,
        })
    }

    /// Start building a workflow step by step
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            description: None,
            inputs: Vec::new(),
            registry: StepRegistry::new(),
            error: None,
        }
    }

    /// Get a step by ID
    pub fn step(&self, id: &str) -> Option<&Arc<StepDefinition>> {
        self.registry.get(id)
    }

    /// Steps in registration order
    pub fn steps(&self) -> impl Iterator<Item = &Arc<StepDefinition>> {
        self.registry.iter()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Get execution order (topological sort)
    pub fn execution_order(&self) -> &[String] {
        &self.topo_order
    }

    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The human-review gate, if the workflow has one
    pub fn gate(&self) -> Option<&str> {
        self.gate.as_deref()
    }

    pub fn groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }

    /// Members of the parallel group `id` belongs to (including itself)
    pub fn group_members(&self, id: &str) -> &[String] {
        self.step(id)
            .and_then(|s| s.parallel_group.as_ref())
            .and_then(|g| self.groups.get(g))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn topological_sort(registry: &StepRegistry) -> Result<Vec<String>, ValidationError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for step in registry.iter() {
            indices.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
        }

        for step in registry.iter() {
            let to = indices[step.id.as_str()];
            for dep in &step.depends_on {
                let from = indices.get(dep.as_str()).ok_or_else(|| {
                    ValidationError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        let sorted = toposort(&graph, None)
            .map_err(|cycle| ValidationError::CycleDetected(graph[cycle.node_id()].to_string()))?;

        Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
    }

    fn find_gate(registry: &StepRegistry) -> Result<Option<String>, ValidationError> {
        let mut gate: Option<&StepDefinition> = None;
        for step in registry.iter().filter(|s| s.is_gate()) {
            if let Some(first) = gate {
                return Err(ValidationError::MultipleGates {
                    first: first.id.clone(),
                    second: step.id.clone(),
                });
            }
            if step.parallel_group.is_some() {
                return Err(ValidationError::GateInParallelGroup(step.id.clone()));
            }
            gate = Some(step);
        }
        Ok(gate.map(|s| s.id.clone()))
    }

    fn collect_groups(
        registry: &StepRegistry,
    ) -> Result<BTreeMap<String, Vec<String>>, ValidationError> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut shared_preds: HashMap<&str, Vec<&String>> = HashMap::new();

        for step in registry.iter() {
            let Some(group) = step.parallel_group.as_deref() else {
                continue;
            };
            let mut preds: Vec<&String> = step.depends_on.iter().collect();
            preds.sort();
            preds.dedup();
            match shared_preds.get(group) {
                Some(expected) if *expected != preds => {
                    return Err(ValidationError::GroupPredecessorMismatch {
                        group: group.to_string(),
                        step: step.id.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    shared_preds.insert(group, preds);
                }
            }
            groups.entry(group.to_string()).or_default().push(step.id.clone());
        }

        Ok(groups)
    }

    fn check_outputs(registry: &StepRegistry) -> Result<(), ValidationError> {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for step in registry.iter() {
            let found = step.outputs.len();
            match &step.capability {
                Capability::ReviewGate { .. } if found > 1 => {
                    return Err(ValidationError::OutputArity {
                        step: step.id.clone(),
                        expected: "zero or one",
                        found,
                    });
                }
                Capability::Generate { .. } | Capability::Transform(_) if found != 1 => {
                    return Err(ValidationError::OutputArity {
                        step: step.id.clone(),
                        expected: "exactly one",
                        found,
                    });
                }
                _ => {}
            }

            for output in &step.outputs {
                if let Some(first) = owners.insert(output.as_str(), step.id.as_str()) {
                    return Err(ValidationError::DuplicateOutput {
                        output: output.clone(),
                        first: first.to_string(),
                        second: step.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Every required input must come from an ancestor's outputs or the initial inputs
    fn check_inputs(
        registry: &StepRegistry,
        topo_order: &[String],
        initial_inputs: &[String],
    ) -> Result<(), ValidationError> {
        let initial: HashSet<&str> = initial_inputs.iter().map(String::as_str).collect();
        let mut available: HashMap<&str, HashSet<&str>> = HashMap::new();

        for id in topo_order {
            let Some(step) = registry.get(id) else {
                continue;
            };

            let mut upstream: HashSet<&str> = HashSet::new();
            for dep in &step.depends_on {
                if let Some(dep_step) = registry.get(dep) {
                    upstream.extend(dep_step.outputs.iter().map(String::as_str));
                }
                if let Some(inherited) = available.get(dep.as_str()) {
                    upstream.extend(inherited.iter().copied());
                }
            }

            for input in &step.inputs {
                if !initial.contains(input.as_str()) && !upstream.contains(input.as_str()) {
                    return Err(ValidationError::UnsatisfiableInput {
                        step: step.id.clone(),
                        input: input.clone(),
                    });
                }
            }

            available.insert(step.id.as_str(), upstream);
        }
        Ok(())
    }
}

/// Incremental workflow construction
///
/// The first registration error is kept and reported by `build`.
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    description: Option<String>,
    inputs: Vec<String>,
    registry: StepRegistry,
    error: Option<ValidationError>,
}

impl WorkflowBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare an initial input key
    pub fn input(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(key.into());
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.registry.register(step) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, ValidationError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut definition = WorkflowDefinition::new(self.name, self.registry, self.inputs)?;
        definition.description = self.description;
        Ok(definition)
    }
}
