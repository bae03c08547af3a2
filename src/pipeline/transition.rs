//! The status transition writer.
//!
//! Every status change of every task goes through [`Transitions`]: the
//! executor advancing stages, admission promoting queued tasks, cancellation
//! and restart recovery failing tasks. A transition is one compare-and-set on
//! the store; once it applies, it is metered, logged and published in that
//! order.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::OrchestratorError;
use crate::events::{EventNotifier, TaskTransition};
use crate::metrics::{FailureCause, MetricsCollector};
use crate::storage::{RetryPolicy, TaskStore};
use crate::task::{Task, TaskId, TaskPatch, TaskStatus};

/// Upper bound on read-then-write rounds in [`Transitions::fail_current`].
/// Statuses only move forward, so a task can supersede us at most this often.
const MAX_FAIL_ROUNDS: usize = 6;

/// What happened to a requested transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Written and published.
    Applied,
    /// The persisted status no longer matched the patch's expected status.
    Superseded { current: Option<TaskStatus> },
    /// The store kept failing, so the task was moved to `failed` instead.
    Escalated,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// Applies status patches to the store and publishes them.
pub struct Transitions {
    store: Arc<dyn TaskStore>,
    notifier: EventNotifier,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl Transitions {
    pub fn new(store: Arc<dyn TaskStore>, notifier: EventNotifier, retry: RetryPolicy) -> Self {
        Self {
            store,
            notifier,
            retry,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Applies `patch` to `task`.
    ///
    /// A patch that does not follow the status graph is rejected without
    /// touching the store. If the store keeps failing on a non-failure patch,
    /// the task is failed instead and [`TransitionOutcome::Escalated`] is
    /// returned.
    pub async fn apply(
        &self,
        task: &Task,
        patch: TaskPatch,
    ) -> Result<TransitionOutcome, OrchestratorError> {
        if !patch.is_valid() {
            return Err(OrchestratorError::InvalidTransition {
                task_id: task.id,
                from: patch.expected(),
                to: patch.status(),
            });
        }

        let written = self
            .retry
            .run("task update", || self.store.update(task.id, &patch))
            .await;

        match written {
            Ok(true) => {
                self.applied(task, &patch);
                Ok(TransitionOutcome::Applied)
            }
            Ok(false) => {
                let current = self.store.get(task.id).await.ok().flatten();
                let current = current.map(|t| t.status);
                debug!(
                    task_id = %task.id,
                    expected = %patch.expected(),
                    wanted = %patch.status(),
                    current = ?current,
                    "Transition superseded"
                );
                Ok(TransitionOutcome::Superseded { current })
            }
            Err(e) if patch.status() != TaskStatus::Failed => {
                error!(
                    task_id = %task.id,
                    from = %patch.expected(),
                    to = %patch.status(),
                    error = %e,
                    "Store rejected transition; failing task"
                );
                let reason = format!("store rejected {} transition: {}", patch.status(), e);
                match self.fail_current(task.id, FailureCause::Store, reason).await? {
                    Some(_) => Ok(TransitionOutcome::Escalated),
                    None => Ok(TransitionOutcome::Superseded { current: None }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Moves `task` from `from` to `failed`, metering the failure cause.
    pub async fn fail(
        &self,
        task: &Task,
        from: TaskStatus,
        cause: FailureCause,
        reason: impl Into<String>,
    ) -> Result<TransitionOutcome, OrchestratorError> {
        let outcome = self.apply(task, TaskPatch::failed(from, reason)).await?;
        if outcome.is_applied() {
            self.metrics.record_failure(cause);
        }
        Ok(outcome)
    }

    /// Fails the task from whatever non-terminal status it is in now.
    ///
    /// Returns the task as it was before failing, or `None` if it was already
    /// terminal (or unknown).
    pub async fn fail_current(
        &self,
        task_id: TaskId,
        cause: FailureCause,
        reason: impl Into<String>,
    ) -> Result<Option<Task>, OrchestratorError> {
        let reason = reason.into();

        for _ in 0..MAX_FAIL_ROUNDS {
            let Some(task) = self.store.get(task_id).await? else {
                return Ok(None);
            };
            if task.status.is_terminal() {
                return Ok(None);
            }

            let patch = TaskPatch::failed(task.status, reason.clone());
            let written = self
                .retry
                .run("task update", || self.store.update(task_id, &patch))
                .await?;
            if written {
                self.applied(&task, &patch);
                self.metrics.record_failure(cause);
                return Ok(Some(task));
            }
        }

        warn!(task_id = %task_id, "Task kept changing status while being failed");
        Ok(None)
    }

    /// Publishes the initial status of a freshly created task.
    pub fn created(&self, task: &Task) {
        self.metrics.record_transition(task.status, &task.variant);
        info!(
            task_id = %task.id,
            status = %task.status,
            variant = %task.variant,
            working_dir = %task.working_dir.display(),
            "Task created"
        );
        self.notifier.publish(TaskTransition {
            task_id: task.id,
            status: task.status,
            result_ref: task.result_ref.clone(),
        });
    }

    fn applied(&self, task: &Task, patch: &TaskPatch) {
        self.metrics.record_transition(patch.status(), &task.variant);
        match patch.failure() {
            Some(reason) => warn!(
                task_id = %task.id,
                from = %patch.expected(),
                reason = %first_line(reason),
                "Task failed"
            ),
            None => info!(
                task_id = %task.id,
                from = %patch.expected(),
                to = %patch.status(),
                result_ref = ?patch.result_ref(),
                "Task transitioned"
            ),
        }
        self.notifier.publish(TaskTransition {
            task_id: task.id,
            status: patch.status(),
            result_ref: patch.result_ref().map(str::to_string),
        });
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}
