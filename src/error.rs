//! Error types for recon-forge operations.
//!
//! Defines the error types shared across subsystems:
//! - Stage process execution
//! - Orchestrator requests (submit, status, cancel, adopt)
//!
//! Store and configuration errors live next to their modules
//! ([`crate::storage::StoreError`], [`crate::pipeline::ConfigError`]).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::ConfigError;
use crate::stage::StageKind;
use crate::storage::StoreError;
use crate::task::{TaskId, TaskStatus};

/// Errors produced while running a single pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to render {stage} command: {message}")]
    Render { stage: StageKind, message: String },

    #[error("Failed to spawn {stage} command '{program}': {source}")]
    Spawn {
        stage: StageKind,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} stage exited with code {code}")]
    Exit {
        stage: StageKind,
        code: i32,
        tail: String,
    },

    #[error("Output artifact not found under {0}")]
    ArtifactNotFound(PathBuf),

    #[error("{stage} stage exceeded watchdog timeout of {timeout:?}")]
    TimedOut { stage: StageKind, timeout: Duration },

    #[error("{0} stage cancelled")]
    Cancelled(StageKind),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Whether the stage stopped because the task was cancelled.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StageError::Cancelled(_))
    }

    /// Text persisted as the task's failure reason.
    ///
    /// Exit failures carry the captured output tail.
    pub fn failure_reason(&self) -> String {
        match self {
            StageError::Exit { tail, .. } if !tail.is_empty() => {
                format!("{}\n{}", self, tail)
            }
            _ => self.to_string(),
        }
    }
}

/// Errors returned by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Unknown algorithm variant '{0}'")]
    UnknownVariant(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Working directory {0} is owned by another task")]
    WorkdirInUse(PathBuf),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Another orchestrator (pid {pid}) is using the task store")]
    InstanceRunning { pid: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
