//! Task record, status graph and status patches.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a task, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex characters, used to name working directories.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker slot.
    Queued,
    /// Admitted; frame extraction has not finished yet.
    Pending,
    /// Frames extracted.
    Imaged,
    /// Structure recovered (or the variant has no conversion stage).
    Converted,
    /// Training finished and the output artifact was located.
    Trained,
    /// Terminal failure, including operator cancellation.
    Failed,
}

impl TaskStatus {
    /// Statuses that hold a worker slot.
    pub const ACTIVE: [TaskStatus; 3] = [
        TaskStatus::Pending,
        TaskStatus::Imaged,
        TaskStatus::Converted,
    ];

    /// Statuses from which no further transition is possible.
    pub const TERMINAL: [TaskStatus; 2] = [TaskStatus::Trained, TaskStatus::Failed];

    /// Lowercase name used in storage and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Pending => "pending",
            TaskStatus::Imaged => "imaged",
            TaskStatus::Converted => "converted",
            TaskStatus::Trained => "trained",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Trained | TaskStatus::Failed)
    }

    /// Whether a task in this status occupies a worker slot.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Returns whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Pending)
                | (Pending, Imaged)
                | (Imaged, Converted)
                | (Converted, Trained)
                | (Queued | Pending | Imaged | Converted, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "pending" => Ok(TaskStatus::Pending),
            "imaged" => Ok(TaskStatus::Imaged),
            "converted" => Ok(TaskStatus::Converted),
            "trained" => Ok(TaskStatus::Trained),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// One reconstruction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier.
    pub id: TaskId,
    /// Caller-supplied reference to the source media.
    pub artifact_ref: String,
    /// Resolved path of the source media.
    pub input_path: PathBuf,
    /// Directory owned exclusively by this task.
    pub working_dir: PathBuf,
    /// Algorithm variant selecting the stage commands.
    pub variant: String,
    /// Current status.
    pub status: TaskStatus,
    /// Relative path of the output artifact, present only when trained.
    #[serde(default)]
    pub result_ref: Option<String>,
    /// Diagnostic reason recorded with a failure.
    #[serde(default)]
    pub failure: Option<String>,
    /// Creation order assigned by the store.
    #[serde(default)]
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new task record in the given initial status.
    ///
    /// `seq` stays zero until the store assigns it.
    pub fn new(
        artifact_ref: impl Into<String>,
        input_path: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        variant: impl Into<String>,
        status: TaskStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            artifact_ref: artifact_ref.into(),
            input_path: input_path.into(),
            working_dir: working_dir.into(),
            variant: variant.into(),
            status,
            result_ref: None,
            failure: None,
            seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Uses a pre-generated identifier.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Marks the record as already trained with the given result.
    ///
    /// Used when adopting a completed output directory.
    pub fn trained(mut self, result_ref: impl Into<String>) -> Self {
        self.status = TaskStatus::Trained;
        self.result_ref = Some(result_ref.into());
        self
    }

    /// Checks the result/status invariant.
    pub fn is_consistent(&self) -> bool {
        (self.status == TaskStatus::Trained) == self.result_ref.is_some()
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn view(&self) -> TaskStatusView {
        TaskStatusView {
            task_id: self.id,
            status: self.status,
            result_ref: self.result_ref.clone(),
        }
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result_ref: Option<String>,
}

/// Atomic status change applied by a store as one compare-and-set.
///
/// The constructors are the only way to build a patch, so a patch carries a
/// result reference exactly when it moves the task to `trained`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPatch {
    expected: TaskStatus,
    status: TaskStatus,
    result_ref: Option<String>,
    failure: Option<String>,
}

impl TaskPatch {
    /// Moves `from` to a non-terminal successor (`pending`, `imaged`, `converted`).
    pub fn advance(from: TaskStatus, to: TaskStatus) -> Self {
        Self {
            expected: from,
            status: to,
            result_ref: None,
            failure: None,
        }
    }

    /// Moves `converted` to `trained` with the located artifact.
    pub fn trained(result_ref: impl Into<String>) -> Self {
        Self {
            expected: TaskStatus::Converted,
            status: TaskStatus::Trained,
            result_ref: Some(result_ref.into()),
            failure: None,
        }
    }

    /// Moves `from` to `failed`, recording a reason.
    pub fn failed(from: TaskStatus, reason: impl Into<String>) -> Self {
        Self {
            expected: from,
            status: TaskStatus::Failed,
            result_ref: None,
            failure: Some(reason.into()),
        }
    }

    pub fn expected(&self) -> TaskStatus {
        self.expected
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result_ref(&self) -> Option<&str> {
        self.result_ref.as_deref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Whether the patch follows an edge of the status graph and keeps the
    /// result reference tied to `trained`.
    pub fn is_valid(&self) -> bool {
        self.expected.can_transition_to(self.status)
            && (self.status == TaskStatus::Trained) == self.result_ref.is_some()
    }
}
