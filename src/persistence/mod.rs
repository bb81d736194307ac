//! Persistence layer for run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{Run, RunStatus, StepState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run ID
    pub run_id: Uuid,

    /// Workflow name
    pub workflow: String,

    pub status: RunStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    /// Number of succeeded steps
    pub succeeded_steps: usize,

    /// Total number of steps
    pub total_steps: usize,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            workflow: run.workflow.clone(),
            status: run.status,
            created_at: run.created_at,
            updated_at: run.updated_at,
            progress: run.progress(),
            succeeded_steps: run
                .steps
                .values()
                .filter(|r| r.state == StepState::Succeeded)
                .count(),
            total_steps: run.steps.len(),
        }
    }
}

/// Trait for run storage backends
///
/// The engine saves a full snapshot after every state transition.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run snapshot
    async fn save_run(&self, run: &Run) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>>;

    /// List runs of one workflow, newest first
    async fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>>;

    /// List all workflow names with stored runs
    async fn list_workflows(&self) -> Result<Vec<String>>;

    async fn delete_run(&self, run_id: Uuid) -> Result<()>;
}

/// In-memory store (for testing or ephemeral use)
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, Run>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let runs = self.runs.read().await;
        Ok(runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut result: Vec<RunSummary> = runs
            .values()
            .filter(|run| run.workflow == workflow)
            .map(RunSummary::from)
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn list_workflows(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|run| run.workflow.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        self.runs.write().await.remove(&run_id);
        Ok(())
    }
}
