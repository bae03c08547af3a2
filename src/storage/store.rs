//! Task store contract.
//!
//! The orchestrator never talks to a database directly; it goes through
//! [`TaskStore`]. Every status change is a single [`TaskPatch`] applied as a
//! compare-and-set, so readers observe either the old or the new status and
//! result reference, never a mix.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::task::{Task, TaskId, TaskPatch, TaskStatus};

use super::lease::{InstanceLease, LeaseClaim, LeaseState};

/// Errors that can occur during task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A persisted row could not be decoded.
    #[error("Corrupt task row: {0}")]
    Corrupt(String),

    /// A write would break the status/result invariant.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Another task already owns the working directory.
    #[error("Working directory already owned by task {0}")]
    WorkdirTaken(String),
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub artifact_ref: Option<String>,
    pub variant: Option<String>,
    /// Empty means any status.
    pub statuses: Vec<TaskStatus>,
    pub working_dir: Option<PathBuf>,
    pub limit: Option<i64>,
}

impl TaskFilter {
    /// Creates a filter that matches every task.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks occupying a worker slot.
    pub fn active() -> Self {
        Self::new().with_statuses(TaskStatus::ACTIVE.to_vec())
    }

    /// Tasks waiting for admission, oldest first.
    pub fn queued() -> Self {
        Self::new().with_status(TaskStatus::Queued)
    }

    pub fn with_artifact_ref(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<TaskStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `task` satisfies this filter (limit excluded).
    pub fn matches(&self, task: &Task) -> bool {
        self.artifact_ref
            .as_ref()
            .map_or(true, |a| *a == task.artifact_ref)
            && self.variant.as_ref().map_or(true, |v| *v == task.variant)
            && (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && self
                .working_dir
                .as_ref()
                .map_or(true, |d| *d == task.working_dir)
    }
}

/// Durable record store for task state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new task; the store assigns its creation order.
    async fn create(&self, task: &Task) -> Result<TaskId, StoreError>;

    /// Loads a task by id.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Applies `patch` if the persisted status still equals
    /// `patch.expected()`. Returns whether the patch was applied.
    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<bool, StoreError>;

    /// Lists tasks matching `filter` in creation order.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Counts tasks matching `filter`.
    async fn count(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
        Ok(self.list(filter).await?.len())
    }

    /// Claims or renews the single-instance lease.
    ///
    /// Stores that cannot be shared between processes grant every claim.
    async fn claim_lease(&self, _claim: &LeaseClaim<'_>) -> Result<LeaseState, StoreError> {
        Ok(LeaseState::Granted)
    }

    /// Gives the lease up if `lease` still holds it.
    async fn release_lease(&self, _lease: &InstanceLease) -> Result<(), StoreError> {
        Ok(())
    }
}
