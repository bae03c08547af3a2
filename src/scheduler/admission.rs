//! Admission queue.
//!
//! At most `slots` tasks are active (`pending`, `imaged` or `converted`) at a
//! time. Submissions past that limit are persisted as `queued` and promoted in
//! creation order whenever an executor finishes. All decisions that read the
//! active count and then write are taken under one async mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::metrics::MetricsCollector;
use crate::orchestrator::ArtifactResolver;
use crate::pipeline::{PipelineExecutor, TransitionOutcome, Transitions};
use crate::storage::{StoreError, TaskFilter};
use crate::task::{Task, TaskId, TaskLayout, TaskPatch, TaskStatus};

/// Serializes submission and admission.
pub struct AdmissionQueue {
    gate: Mutex<()>,
    slots: usize,
    work_root: PathBuf,
    transitions: Arc<Transitions>,
    executor: Arc<PipelineExecutor>,
    resolver: Arc<dyn ArtifactResolver>,
    metrics: MetricsCollector,
}

impl AdmissionQueue {
    pub fn new(
        slots: usize,
        work_root: impl Into<PathBuf>,
        transitions: Arc<Transitions>,
        executor: Arc<PipelineExecutor>,
        resolver: Arc<dyn ArtifactResolver>,
    ) -> Self {
        Self {
            gate: Mutex::new(()),
            slots: slots.max(1),
            work_root: work_root.into(),
            transitions,
            executor,
            resolver,
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates a task for `(artifact_ref, variant)` unless one already exists.
    ///
    /// A trained task is returned as is, as is a task still queued or
    /// running. When only failed tasks exist, their working directories are
    /// purged and a fresh task is created.
    pub async fn submit(
        &self,
        artifact_ref: &str,
        variant: &str,
    ) -> Result<Task, OrchestratorError> {
        let _gate = self.gate.lock().await;

        let existing = self
            .list(
                TaskFilter::new()
                    .with_artifact_ref(artifact_ref)
                    .with_variant(variant),
            )
            .await?;

        if let Some(task) = existing.iter().find(|t| t.status == TaskStatus::Trained) {
            debug!(task_id = %task.id, artifact_ref, variant, "Reusing trained task");
            return Ok(task.clone());
        }
        if let Some(task) = existing.iter().find(|t| !t.status.is_terminal()) {
            debug!(task_id = %task.id, status = %task.status, "Reusing unfinished task");
            return Ok(task.clone());
        }
        for failed in &existing {
            purge_dir(failed);
        }

        let input_path = self.resolver.resolve(artifact_ref).await?;
        let active = self.count(TaskFilter::active()).await?;
        let status = if active < self.slots {
            TaskStatus::Pending
        } else {
            TaskStatus::Queued
        };

        let id = TaskId::new();
        let layout = TaskLayout::for_input(&self.work_root, &input_path, id);
        layout.create().map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                OrchestratorError::WorkdirInUse(layout.root().to_path_buf())
            }
            _ => OrchestratorError::Io(e),
        })?;

        let task =
            Task::new(artifact_ref, input_path, layout.root(), variant, status).with_id(id);
        let task = match self.insert(&task).await {
            Ok(task) => task,
            Err(e) => {
                if let Err(err) = layout.remove() {
                    warn!(dir = %layout.root().display(), error = %err, "Failed to clean up");
                }
                return Err(e);
            }
        };

        self.transitions.created(&task);
        if status == TaskStatus::Pending {
            self.executor.spawn(task.clone());
        } else {
            info!(task_id = %task.id, active, slots = self.slots, "All slots busy; task queued");
        }
        self.refresh_gauges().await;
        Ok(task)
    }

    /// Registers an existing output directory as a trained task.
    pub async fn adopt(&self, task: Task) -> Result<Task, OrchestratorError> {
        let _gate = self.gate.lock().await;

        let owners = self
            .count(TaskFilter::new().with_working_dir(task.working_dir.clone()))
            .await?;
        if owners > 0 {
            return Err(OrchestratorError::WorkdirInUse(task.working_dir.clone()));
        }

        let task = self.insert(&task).await?;
        self.transitions.created(&task);
        Ok(task)
    }

    /// Promotes queued tasks, oldest first, while slots are free. Returns the
    /// ids of the tasks whose executors were started.
    pub async fn admit_next(&self) -> Result<Vec<TaskId>, OrchestratorError> {
        let gate = self.gate.lock().await;
        let mut admitted = Vec::new();

        loop {
            let active = self.count(TaskFilter::active()).await?;
            if active >= self.slots {
                break;
            }
            let Some(task) = self
                .list(TaskFilter::queued().with_limit(1))
                .await?
                .into_iter()
                .next()
            else {
                break;
            };

            let patch = TaskPatch::advance(TaskStatus::Queued, TaskStatus::Pending);
            match self.transitions.apply(&task, patch).await? {
                TransitionOutcome::Applied => {
                    let mut task = task;
                    task.status = TaskStatus::Pending;
                    info!(task_id = %task.id, "Admitted queued task");
                    admitted.push(task.id);
                    self.executor.spawn(task);
                }
                // Cancelled (or escalated) while queued; look at the next one
                outcome => {
                    debug!(task_id = %task.id, outcome = ?outcome, "Queued task skipped")
                }
            }
        }

        drop(gate);
        self.refresh_gauges().await;
        Ok(admitted)
    }

    /// Admits queued work every time an executor reports completion. Runs
    /// until every sender is gone.
    pub async fn run_scheduler(
        self: Arc<Self>,
        mut completions: mpsc::UnboundedReceiver<TaskId>,
    ) {
        info!(slots = self.slots, "Admission scheduler started");
        while let Some(task_id) = completions.recv().await {
            debug!(task_id = %task_id, "Slot released");
            if let Err(e) = self.admit_next().await {
                warn!(error = %e, "Admission pass failed");
            }
        }
        info!("Admission scheduler stopped");
    }

    /// Updates the queue depth and active slot gauges.
    pub async fn refresh_gauges(&self) {
        let queued = self.count(TaskFilter::queued()).await;
        let active = self.count(TaskFilter::active()).await;
        match (queued, active) {
            (Ok(queued), Ok(active)) => self.metrics.update_admission(queued, active),
            (Err(e), _) | (_, Err(e)) => debug!(error = %e, "Skipping gauge refresh"),
        }
    }

    async fn insert(&self, task: &Task) -> Result<Task, OrchestratorError> {
        let store = self.transitions.store();
        let created = self
            .transitions
            .retry()
            .run("task create", || store.create(task))
            .await;
        match created {
            Ok(id) => Ok(store.get(id).await?.unwrap_or_else(|| task.clone())),
            Err(StoreError::WorkdirTaken(_)) => {
                Err(OrchestratorError::WorkdirInUse(task.working_dir.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, OrchestratorError> {
        let store = self.transitions.store();
        let tasks = self
            .transitions
            .retry()
            .run("task list", || store.list(&filter))
            .await?;
        Ok(tasks)
    }

    async fn count(&self, filter: TaskFilter) -> Result<usize, OrchestratorError> {
        let store = self.transitions.store();
        let count = self
            .transitions
            .retry()
            .run("task count", || store.count(&filter))
            .await?;
        Ok(count)
    }
}

fn purge_dir(task: &Task) {
    let dir: &Path = task.working_dir();
    if !dir.exists() {
        return;
    }
    match TaskLayout::new(dir).remove() {
        Ok(()) => info!(task_id = %task.id, dir = %dir.display(), "Purged failed task directory"),
        Err(e) => warn!(
            task_id = %task.id,
            dir = %dir.display(),
            error = %e,
            "Failed to purge task directory"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationController;
    use crate::events::{EventNotifier, NoDependents};
    use crate::orchestrator::PathResolver;
    use crate::stage::{StageCommand, StageRunner, VariantRegistry, VariantSpec};
    use crate::storage::{RetryPolicy, SqliteTaskStore, TaskStore};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        store: Arc<SqliteTaskStore>,
        queue: Arc<AdmissionQueue>,
        completions: mpsc::UnboundedReceiver<TaskId>,
        media: TempDir,
        _work: TempDir,
    }

    async fn harness(slots: usize, train: &str) -> Harness {
        let store = Arc::new(SqliteTaskStore::open_in_memory().await.unwrap());
        let notifier = EventNotifier::spawn(16, Arc::new(NoDependents), RetryPolicy::once());
        let transitions = Arc::new(Transitions::new(store.clone(), notifier, RetryPolicy::once()));

        let mut variants = VariantRegistry::empty();
        variants
            .insert(
                "test",
                VariantSpec {
                    description: None,
                    frames: StageCommand::new("true"),
                    convert: None,
                    train: StageCommand::new("sh").with_args(["-c", train]),
                    artifact: "model.ply".to_string(),
                },
            )
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Arc::new(PipelineExecutor::new(
            transitions.clone(),
            Arc::new(CancellationController::new(Duration::from_secs(1))),
            Arc::new(variants),
            StageRunner::new(20, Duration::from_secs(1)),
            PathBuf::from("/"),
            slots,
            Duration::from_millis(50),
            tx,
        ));

        let media = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let queue = Arc::new(AdmissionQueue::new(
            slots,
            work.path(),
            transitions,
            executor,
            Arc::new(PathResolver::with_base(media.path())),
        ));

        Harness {
            store,
            queue,
            completions: rx,
            media,
            _work: work,
        }
    }

    fn media(h: &Harness, name: &str) -> String {
        std::fs::write(h.media.path().join(name), b"mp4").unwrap();
        name.to_string()
    }

    async fn wait_terminal(h: &Harness, id: TaskId) -> Task {
        for _ in 0..200 {
            let task = h.store.get(id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {} never finished", id);
    }

    #[tokio::test]
    async fn test_second_submission_queues_when_slot_busy() {
        let mut h = harness(
            1,
            "sleep 0.3 && mkdir -p {{results_dir}} && touch {{results_dir}}/model.ply",
        ).await;
        let a = h.queue.submit(&media(&h, "a.mp4"), "test").await.unwrap();
        let b = h.queue.submit(&media(&h, "b.mp4"), "test").await.unwrap();

        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(b.status, TaskStatus::Queued);
        assert!(a.seq < b.seq);

        let done = h.completions.recv().await.unwrap();
        assert_eq!(done, a.id);
        assert_eq!(h.queue.admit_next().await.unwrap(), vec![b.id]);

        assert_eq!(wait_terminal(&h, b.id).await.status, TaskStatus::Trained);
    }

    #[tokio::test]
    async fn test_submit_is_idempotent() {
        let h = harness(1, "sleep 5").await;
        let clip = media(&h, "clip.mp4");

        let first = h.queue.submit(&clip, "test").await.unwrap();
        let again = h.queue.submit(&clip, "test").await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(h.store.count(&TaskFilter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_task_is_replaced_and_purged() {
        let h = harness(1, "exit 1").await;
        let clip = media(&h, "clip.mp4");

        let first = h.queue.submit(&clip, "test").await.unwrap();
        assert_eq!(wait_terminal(&h, first.id).await.status, TaskStatus::Failed);
        assert!(first.working_dir.exists());

        let second = h.queue.submit(&clip, "test").await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(!first.working_dir.exists());
        assert_eq!(wait_terminal(&h, second.id).await.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_unresolvable_input_creates_nothing() {
        let h = harness(1, "true").await;
        let err = h.queue.submit("missing.mp4", "test").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ArtifactNotFound(_)));
        assert_eq!(h.store.count(&TaskFilter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_adopt_rejects_owned_directory() {
        let h = harness(1, "true").await;
        let dir = h.media.path().join("done");
        let task = Task::new("clip.mp4", "clip.mp4", &dir, "test", TaskStatus::Queued)
            .trained("done/model.ply");

        let adopted = h.queue.adopt(task.clone()).await.unwrap();
        assert_eq!(adopted.status, TaskStatus::Trained);

        let again = Task::new("other.mp4", "other.mp4", &dir, "test", TaskStatus::Queued)
            .trained("done/model.ply");
        let err = h.queue.adopt(again).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkdirInUse(_)));
    }
}
