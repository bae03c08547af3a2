//! Status-change events.
//!
//! Every applied transition is handed to the [`EventNotifier`], which resolves
//! the dependent entities of the task and fans the resulting [`TaskEvent`] out
//! to live subscribers. [`sse`] renders notifications for an event-stream
//! transport.

pub mod lookup;
pub mod notifier;
pub mod sse;

use serde::{Deserialize, Serialize};

use crate::task::{TaskId, TaskStatus};

pub use lookup::{DependentLookup, LookupError, NoDependents};
pub use notifier::{EventNotifier, SubscriberId, Subscription, MAX_CONSECUTIVE_FULL};

/// A transition as reported by the transition writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTransition {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result_ref: Option<String>,
}

/// Event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    pub affected_entity_ids: Vec<String>,
}

/// Item read from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// First item of every subscription.
    Connected,
    Task(TaskEvent),
}
