//! Pipeline executor.
//!
//! Drives one admitted task through `frames`, `convert` and `train`. The
//! executor owns no status: it asks [`Transitions`] to move the task after each
//! stage and stops as soon as a transition does not apply, which is how a
//! concurrent cancellation (or restart recovery in another process) takes the
//! task away from it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancel::{CancellationController, TaskCancellation};
use crate::error::StageError;
use crate::metrics::{FailureCause, MetricsCollector};
use crate::stage::{
    RenderedCommand, StageContext, StageKind, StageReport, StageRunner, VariantRegistry,
};
use crate::task::{Task, TaskId, TaskLayout, TaskPatch, TaskStatus};

use super::artifact::locate_artifact;
use super::transition::{TransitionOutcome, Transitions};

/// Reason recorded for operator cancellations.
pub const CANCELLED_REASON: &str = "cancelled";

/// Runs admitted tasks.
pub struct PipelineExecutor {
    transitions: Arc<Transitions>,
    controller: Arc<CancellationController>,
    variants: Arc<VariantRegistry>,
    runner: StageRunner,
    toolkit_dir: PathBuf,
    slots: Arc<Semaphore>,
    status_poll: Duration,
    completions: mpsc::UnboundedSender<TaskId>,
    metrics: MetricsCollector,
}

/// How a stage loop ended, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Trained,
    Failed,
    Cancelled,
    Abandoned,
}

impl PipelineExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transitions: Arc<Transitions>,
        controller: Arc<CancellationController>,
        variants: Arc<VariantRegistry>,
        runner: StageRunner,
        toolkit_dir: PathBuf,
        slots: usize,
        status_poll: Duration,
        completions: mpsc::UnboundedSender<TaskId>,
    ) -> Self {
        Self {
            transitions,
            controller,
            variants,
            runner,
            toolkit_dir,
            slots: Arc::new(Semaphore::new(slots.max(1))),
            status_poll,
            completions,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs `task` on a new tokio task.
    pub fn spawn(self: &Arc<Self>, task: Task) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move { executor.execute(task).await })
    }

    /// Runs `task` (which must be `pending`) to a terminal status, then
    /// signals completion to the admission queue.
    pub async fn execute(&self, task: Task) {
        let task_id = task.id;
        let record = self.controller.begin(task_id);

        // A cancelled predecessor keeps its permit until its processes exit
        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
            _ = record.token().cancelled() => None,
        };

        let finish = match permit {
            Some(_permit) => self.run_stages(&task, &record).await,
            None => Finish::Cancelled,
        };

        self.controller.release(task_id);
        debug!(task_id = %task_id, finish = ?finish, "Executor finished");
        if self.completions.send(task_id).is_err() {
            debug!(task_id = %task_id, "Admission queue is gone");
        }
    }

    async fn run_stages(&self, task: &Task, record: &Arc<TaskCancellation>) -> Finish {
        let layout = TaskLayout::new(&task.working_dir);
        let mut current = TaskStatus::Pending;

        let spec = match self.variants.resolve(&task.variant) {
            Ok(spec) => spec.clone(),
            Err(e) => {
                self.fail(task, current, FailureCause::Stage, e.to_string()).await;
                return Finish::Failed;
            }
        };
        let context = StageContext::new(
            task.id,
            &task.variant,
            &task.input_path,
            &layout,
            &self.toolkit_dir,
        );

        for stage in StageKind::ALL {
            if !self.still_owned(task.id, current, record).await {
                self.abandon(task, &layout).await;
                return Finish::Abandoned;
            }

            let Some(command) = spec.command(stage) else {
                info!(task_id = %task.id, stage = %stage, "Variant has no such stage; skipping");
                match self.advance(task, current, stage.target_status()).await {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => return Finish::Abandoned,
                }
            };

            let rendered = match command.render(stage, &context) {
                Ok(rendered) => rendered,
                Err(e) => {
                    self.fail(task, current, FailureCause::Stage, e.failure_reason()).await;
                    return Finish::Failed;
                }
            };

            let started = std::time::Instant::now();
            let result = self.run_watched(task.id, &rendered, record).await;
            self.metrics
                .record_stage(stage, stage_outcome(&result), started.elapsed());

            match result {
                Ok(_) if stage == StageKind::Train => {
                    return self.finish_training(task, &layout, &spec.artifact).await;
                }
                Ok(report) => {
                    debug!(
                        task_id = %task.id,
                        stage = %stage,
                        output_lines = report.output_tail.len(),
                        "Stage output captured"
                    );
                    match self.advance(task, current, stage.target_status()).await {
                        Some(next) => current = next,
                        None => return Finish::Abandoned,
                    }
                }
                Err(e) if e.is_cancellation() => {
                    // Whoever cancelled has normally persisted `failed` already
                    if let Err(err) = self
                        .transitions
                        .fail_current(task.id, FailureCause::Cancelled, CANCELLED_REASON)
                        .await
                    {
                        error!(task_id = %task.id, error = %err, "Failed to record cancellation");
                    }
                    self.abandon(task, &layout).await;
                    return Finish::Cancelled;
                }
                Err(e) => {
                    if record.is_cancelled() || self.failed_elsewhere(task.id).await {
                        info!(
                            task_id = %task.id,
                            stage = %stage,
                            error = %e,
                            "Stage ended after task was failed elsewhere"
                        );
                        self.abandon(task, &layout).await;
                        return Finish::Cancelled;
                    }
                    self.fail(task, current, FailureCause::Stage, e.failure_reason()).await;
                    return Finish::Failed;
                }
            }
        }

        Finish::Failed
    }

    async fn finish_training(&self, task: &Task, layout: &TaskLayout, artifact: &str) -> Finish {
        match locate_artifact(layout.root(), artifact) {
            Some(found) => {
                info!(
                    task_id = %task.id,
                    artifact = %found.path.display(),
                    "Located training artifact"
                );
                match self
                    .transitions
                    .apply(task, TaskPatch::trained(found.result_ref))
                    .await
                {
                    Ok(TransitionOutcome::Applied) => Finish::Trained,
                    Ok(_) => Finish::Abandoned,
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "Failed to record trained task");
                        Finish::Failed
                    }
                }
            }
            None => {
                let err = StageError::ArtifactNotFound(layout.results_dir());
                self.fail(
                    task,
                    TaskStatus::Converted,
                    FailureCause::MissingArtifact,
                    err.failure_reason(),
                )
                .await;
                Finish::Failed
            }
        }
    }

    /// Runs a stage while polling the persisted status, so a `failed` written
    /// by another process also stops the process tree.
    async fn run_watched(
        &self,
        task_id: TaskId,
        command: &RenderedCommand,
        record: &Arc<TaskCancellation>,
    ) -> Result<StageReport, StageError> {
        let run = self.runner.run(task_id, command, record);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            () = self.watch_persisted_status(task_id) => run.await,
        }
    }

    /// Returns once the persisted status became terminal, after cancelling
    /// the task's process groups.
    async fn watch_persisted_status(&self, task_id: TaskId) {
        let mut ticker = tokio::time::interval(self.status_poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.transitions.store().get(task_id).await {
                Ok(Some(task)) if !task.status.is_terminal() => continue,
                Ok(Some(task)) => {
                    info!(
                        task_id = %task_id,
                        status = %task.status,
                        "Task finished elsewhere; stopping running stage"
                    );
                    break;
                }
                Ok(None) => {
                    warn!(task_id = %task_id, "Task record disappeared; stopping running stage");
                    break;
                }
                Err(e) => debug!(task_id = %task_id, error = %e, "Status poll failed"),
            }
        }

        self.controller.cancel(task_id).await;
    }

    /// Whether this executor may still run the next stage.
    async fn still_owned(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        record: &TaskCancellation,
    ) -> bool {
        if record.is_cancelled() {
            return false;
        }
        match self.transitions.store().get(task_id).await {
            Ok(Some(task)) if task.status == expected => true,
            Ok(Some(task)) => {
                info!(
                    task_id = %task_id,
                    expected = %expected,
                    status = %task.status,
                    "Task status changed underneath executor"
                );
                false
            }
            Ok(None) => false,
            // The next transition is a compare-and-set, so a stale read is harmless
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Status check failed; continuing");
                true
            }
        }
    }

    async fn failed_elsewhere(&self, task_id: TaskId) -> bool {
        matches!(
            self.transitions.store().get(task_id).await,
            Ok(Some(task)) if task.status == TaskStatus::Failed
        )
    }

    /// Stops working on a task that was taken away (cancelled or failed
    /// elsewhere). Cancelled tasks do not keep their working directory.
    async fn abandon(&self, task: &Task, layout: &TaskLayout) {
        let current = self.transitions.store().get(task.id).await.ok().flatten();
        let cancelled = current
            .as_ref()
            .map(|t| t.status == TaskStatus::Failed)
            .unwrap_or(true);
        if cancelled {
            if let Err(e) = layout.remove() {
                warn!(
                    task_id = %task.id,
                    dir = %layout.root().display(),
                    error = %e,
                    "Failed to remove working directory"
                );
            }
        }
    }

    async fn advance(&self, task: &Task, from: TaskStatus, to: TaskStatus) -> Option<TaskStatus> {
        match self.transitions.apply(task, TaskPatch::advance(from, to)).await {
            Ok(TransitionOutcome::Applied) => Some(to),
            Ok(outcome) => {
                debug!(
                    task_id = %task.id,
                    outcome = ?outcome,
                    "Stopping after unapplied transition"
                );
                None
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Transition failed");
                None
            }
        }
    }

    async fn fail(&self, task: &Task, from: TaskStatus, cause: FailureCause, reason: String) {
        if let Err(e) = self.transitions.fail(task, from, cause, reason).await {
            error!(task_id = %task.id, error = %e, "Failed to record task failure");
        }
    }
}

fn stage_outcome(result: &Result<StageReport, StageError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(StageError::Cancelled(_)) => "cancelled",
        Err(StageError::TimedOut { .. }) => "timeout",
        Err(_) => "failure",
    }
}
