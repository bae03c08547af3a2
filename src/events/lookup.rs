//! Lookup of higher-level entities that depend on a task.

use async_trait::async_trait;
use thiserror::Error;

use crate::task::TaskId;

#[derive(Debug, Error)]
#[error("Dependent lookup failed: {0}")]
pub struct LookupError(pub String);

/// Answers "which entities (projects) depend on task X".
///
/// Called by the event notifier for every published transition.
#[async_trait]
pub trait DependentLookup: Send + Sync {
    async fn dependents(&self, task_id: TaskId) -> Result<Vec<String>, LookupError>;
}

/// Lookup for deployments without dependent entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependents;

#[async_trait]
impl DependentLookup for NoDependents {
    async fn dependents(&self, _task_id: TaskId) -> Result<Vec<String>, LookupError> {
        Ok(Vec::new())
    }
}
