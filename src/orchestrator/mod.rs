//! Public facade of the orchestrator.
//!
//! [`Orchestrator`] wires the task store, the admission queue, the pipeline
//! executor, the cancellation controller and the event notifier together and
//! exposes the operations callers use: submit, status, cancel, subscribe,
//! recover and adopt.
//!
//! # Example
//!
//! ```rust,ignore
//! use recon_forge::orchestrator::Orchestrator;
//! use recon_forge::pipeline::OrchestratorConfig;
//!
//! let config = OrchestratorConfig::from_env()?;
//! let orchestrator = Orchestrator::open(config).await?;
//! orchestrator.recover().await?;
//!
//! let task = orchestrator.submit("uploads/clip.mp4", None).await?;
//! let mut events = orchestrator.subscribe();
//! while let Some(notification) = events.recv().await {
//!     println!("{:?}", notification);
//! }
//! ```

pub mod resolver;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cancel::{process_alive, CancellationController};
use crate::error::{OrchestratorError, Result};
use crate::events::{DependentLookup, EventNotifier, NoDependents, SubscriberId, Subscription};
use crate::metrics::{FailureCause, MetricsCollector};
use crate::pipeline::{locate_artifact, OrchestratorConfig, PipelineExecutor, Transitions};
use crate::scheduler::AdmissionQueue;
use crate::stage::VariantRegistry;
use crate::storage::{
    InstanceLease, LeaseClaim, LeaseState, SqliteTaskStore, TaskFilter, TaskStore,
};
use crate::task::{Task, TaskId, TaskLayout, TaskStatus, TaskStatusView};

pub use resolver::{ArtifactResolver, PathResolver};

/// Failure reason recorded when an operator cancels a task.
pub const OPERATOR_CANCEL_REASON: &str = "cancelled by operator";

/// Failure reason recorded for tasks found running at startup.
pub const INTERRUPTED_REASON: &str = "interrupted by orchestrator restart";

/// Result of [`Orchestrator::cancel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task had already finished; nothing was changed.
    AlreadyTerminal { status: TaskStatus },
    /// The task was failed and its process tree stopped.
    Cancelled {
        previous: TaskStatus,
        killed_groups: usize,
    },
}

/// Result of [`Orchestrator::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Tasks that were running when the previous process stopped.
    pub interrupted: Vec<TaskId>,
    /// Queued tasks admitted afterwards.
    pub admitted: Vec<TaskId>,
}

/// The reconstruction task orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    variants: Arc<VariantRegistry>,
    transitions: Arc<Transitions>,
    controller: Arc<CancellationController>,
    admission: Arc<AdmissionQueue>,
    resolver: Arc<dyn ArtifactResolver>,
    completions: mpsc::UnboundedSender<TaskId>,
    scheduler: JoinHandle<()>,
    lease: InstanceLease,
    lease_keeper: Mutex<Option<JoinHandle<()>>>,
    metrics: MetricsCollector,
}

impl Orchestrator {
    /// Builds an orchestrator over `store` and starts its admission
    /// scheduler. Must be called from within a tokio runtime.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        resolver: Arc<dyn ArtifactResolver>,
        dependents: Arc<dyn DependentLookup>,
    ) -> Result<Self> {
        config.validate()?;
        let config = config.with_absolute_paths()?;
        let variants = Arc::new(config.load_variants()?);
        let retry = config.retry_policy();

        let notifier = EventNotifier::spawn(config.subscriber_buffer, dependents, retry);
        let transitions = Arc::new(Transitions::new(store, notifier, retry));
        let controller = Arc::new(CancellationController::new(config.grace_period));

        let (completions, completion_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(PipelineExecutor::new(
            Arc::clone(&transitions),
            Arc::clone(&controller),
            Arc::clone(&variants),
            config.stage_runner(),
            config.toolkit_dir.clone(),
            config.slots,
            config.status_poll_interval,
            completions.clone(),
        ));
        let admission = Arc::new(AdmissionQueue::new(
            config.slots,
            config.work_root.clone(),
            Arc::clone(&transitions),
            executor,
            Arc::clone(&resolver),
        ));
        let scheduler = tokio::spawn(Arc::clone(&admission).run_scheduler(completion_rx));

        info!(
            slots = config.slots,
            work_root = %config.work_root.display(),
            variants = variants.len(),
            "Orchestrator started"
        );

        Ok(Self {
            config,
            variants,
            transitions,
            controller,
            admission,
            resolver,
            completions,
            scheduler,
            lease: InstanceLease::for_current_process(),
            lease_keeper: Mutex::new(None),
            metrics: MetricsCollector::new(),
        })
    }

    /// Opens the SQLite store named by the configuration and builds an
    /// orchestrator that resolves artifact references as file paths.
    pub async fn open(config: OrchestratorConfig) -> Result<Self> {
        let store = SqliteTaskStore::connect(&config.database_url).await?;
        Self::new(
            config,
            Arc::new(store),
            Arc::new(PathResolver::new()),
            Arc::new(NoDependents),
        )
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn variants(&self) -> &VariantRegistry {
        &self.variants
    }

    /// Submits `artifact_ref` for reconstruction with `variant` (or the
    /// configured default). Idempotent per `(artifact_ref, variant)`.
    pub async fn submit(&self, artifact_ref: &str, variant: Option<&str>) -> Result<Task> {
        let variant = self.variant_name(variant)?;
        self.admission.submit(artifact_ref, variant).await
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatusView> {
        Ok(self.task(task_id).await?.view())
    }

    pub async fn task(&self, task_id: TaskId) -> Result<Task> {
        self.transitions
            .store()
            .get(task_id)
            .await?
            .ok_or(OrchestratorError::NotFound(task_id))
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.transitions.store().list(filter).await?)
    }

    /// Cancels a task.
    ///
    /// The task is failed first, so observers see `failed` before anything
    /// else happens. Its process groups are then terminated, its working
    /// directory removed and the admission queue woken up.
    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome> {
        let task = self.task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal {
                status: task.status,
            });
        }

        let Some(previous) = self
            .transitions
            .fail_current(task_id, FailureCause::Cancelled, OPERATOR_CANCEL_REASON)
            .await?
        else {
            // Finished on its own in the meantime
            let status = self.task(task_id).await?.status;
            return Ok(CancelOutcome::AlreadyTerminal { status });
        };

        self.metrics.record_cancellation();
        let report = self.controller.cancel(task_id).await;

        let layout = TaskLayout::new(&previous.working_dir);
        if let Err(e) = layout.remove() {
            warn!(
                task_id = %task_id,
                dir = %layout.root().display(),
                error = %e,
                "Failed to remove working directory of cancelled task"
            );
        }

        let _ = self.completions.send(task_id);
        info!(
            task_id = %task_id,
            previous = %previous.status,
            groups = report.groups.len(),
            "Task cancelled"
        );

        Ok(CancelOutcome::Cancelled {
            previous: previous.status,
            killed_groups: report.groups.len(),
        })
    }

    pub fn subscribe(&self) -> Subscription {
        self.transitions.notifier().subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.transitions.notifier().unsubscribe(id)
    }

    /// Applies the restart policy: tasks left active by a previous process
    /// are failed, then queued tasks are admitted in creation order.
    ///
    /// Takes the store's instance lease first, so this fails with
    /// `InstanceRunning` instead of tearing down another live orchestrator's
    /// tasks.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.acquire_lease().await?;

        let stale = self.list(&TaskFilter::active()).await?;
        let mut report = RecoveryReport::default();

        for task in stale {
            // Tasks this process is already running are not stale
            if self.controller.get(task.id).is_some() {
                continue;
            }
            let failed = self
                .transitions
                .fail_current(task.id, FailureCause::Interrupted, INTERRUPTED_REASON)
                .await?;
            if failed.is_some() {
                report.interrupted.push(task.id);
            }
        }

        report.admitted = self.admission.admit_next().await?;
        info!(
            interrupted = report.interrupted.len(),
            admitted = report.admitted.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    /// Takes the single-instance lease on the task store and keeps it renewed
    /// until [`Orchestrator::shutdown`] or drop.
    ///
    /// A lease held by a process that no longer exists on this host is taken
    /// over. Calling this again while holding the lease only renews it.
    pub async fn acquire_lease(&self) -> Result<()> {
        let store = self.transitions.store();
        let ttl = self.config.lease_ttl;

        match store.claim_lease(&LeaseClaim::new(&self.lease, ttl)).await? {
            LeaseState::Granted => {}
            LeaseState::Held(holder) if !process_alive(holder.pid) => {
                warn!(
                    owner = %holder.owner,
                    pid = holder.pid,
                    heartbeat_at = %holder.heartbeat_at,
                    "Previous orchestrator is gone; taking over its lease"
                );
                let claim = LeaseClaim::new(&self.lease, ttl).evicting(&holder.owner);
                if let LeaseState::Held(holder) = store.claim_lease(&claim).await? {
                    return Err(OrchestratorError::InstanceRunning { pid: holder.pid });
                }
            }
            LeaseState::Held(holder) => {
                return Err(OrchestratorError::InstanceRunning { pid: holder.pid });
            }
        }

        let mut keeper = self.lease_keeper.lock().unwrap_or_else(|e| e.into_inner());
        if keeper.as_ref().map_or(true, |handle| handle.is_finished()) {
            info!(owner = %self.lease.owner, ttl_secs = ttl.as_secs(), "Instance lease acquired");
            *keeper = Some(tokio::spawn(keep_lease(
                Arc::clone(store),
                self.lease.clone(),
                ttl,
            )));
        }
        Ok(())
    }

    /// Stops renewing and gives up the instance lease.
    pub async fn shutdown(&self) {
        let keeper = self
            .lease_keeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(keeper) = keeper {
            keeper.abort();
            if let Err(e) = self.transitions.store().release_lease(&self.lease).await {
                warn!(error = %e, "Failed to release instance lease");
            }
        }
    }

    /// Registers a directory holding a finished reconstruction as a trained
    /// task for `(artifact_ref, variant)`.
    pub async fn adopt(
        &self,
        artifact_ref: &str,
        variant: Option<&str>,
        dir: &Path,
    ) -> Result<Task> {
        let variant = self.variant_name(variant)?;
        let spec = self.variants.resolve(variant)?;

        let dir = std::path::absolute(dir)?;
        let located = locate_artifact(&dir, &spec.artifact)
            .ok_or_else(|| OrchestratorError::ArtifactNotFound(dir.display().to_string()))?;

        let input_path = match self.resolver.resolve(artifact_ref).await {
            Ok(path) => path,
            Err(_) => PathBuf::from(artifact_ref),
        };

        let task = Task::new(artifact_ref, input_path, &dir, variant, TaskStatus::Queued)
            .trained(located.result_ref);
        let task = self.admission.adopt(task).await?;
        info!(
            task_id = %task.id,
            dir = %dir.display(),
            result_ref = ?task.result_ref,
            "Adopted existing reconstruction"
        );
        Ok(task)
    }

    fn variant_name<'a>(&'a self, variant: Option<&'a str>) -> Result<&'a str> {
        let name = variant.unwrap_or(self.config.default_variant.as_str());
        if self.variants.contains(name) {
            Ok(name)
        } else {
            Err(OrchestratorError::UnknownVariant(name.to_string()))
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.scheduler.abort();
        if let Some(keeper) = self
            .lease_keeper
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            keeper.abort();
        }
    }
}

/// Renews the instance lease until the task is aborted or the lease is lost.
async fn keep_lease(store: Arc<dyn TaskStore>, lease: InstanceLease, ttl: std::time::Duration) {
    let mut ticker = tokio::time::interval((ttl / 3).max(std::time::Duration::from_millis(10)));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match store.claim_lease(&LeaseClaim::new(&lease, ttl)).await {
            Ok(LeaseState::Granted) => {}
            Ok(LeaseState::Held(holder)) => {
                error!(
                    owner = %holder.owner,
                    pid = holder.pid,
                    "Instance lease taken over by another orchestrator"
                );
                return;
            }
            Err(e) => warn!(error = %e, "Failed to renew instance lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPatch;
    use std::time::Duration;
    use tempfile::TempDir;

    const VARIANTS: &str = r#"
variants:
  quick:
    frames:
      program: "true"
    train:
      program: sh
      args: ["-c", "mkdir -p {{results_dir}} && touch {{results_dir}}/model.ply"]
    artifact: model.ply
"#;

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<SqliteTaskStore>,
        dir: TempDir,
    }

    fn orchestrator_on(dir: &Path, store: Arc<SqliteTaskStore>) -> Orchestrator {
        let variants = dir.join("variants.yaml");
        std::fs::write(&variants, VARIANTS).unwrap();

        let config = OrchestratorConfig::new()
            .with_work_root(dir.join("work"))
            .with_variants_file(&variants)
            .with_default_variant("quick")
            .with_grace_period(Duration::from_secs(1))
            .with_status_poll_interval(Duration::from_millis(50));
        Orchestrator::new(
            config,
            store,
            Arc::new(PathResolver::with_base(dir)),
            Arc::new(NoDependents),
        )
        .unwrap()
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteTaskStore::open_in_memory().await.unwrap());
        let orchestrator = orchestrator_on(dir.path(), store.clone());

        Harness {
            orchestrator,
            store,
            dir,
        }
    }

    #[tokio::test]
    async fn test_unknown_variant_and_task() {
        let h = harness().await;
        let err = h.orchestrator.submit("clip.mp4", Some("nerf")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownVariant(v) if v == "nerf"));

        let err = h.orchestrator.status(TaskId::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_is_noop() {
        let h = harness().await;
        let workdir = h.dir.path().join("a");
        let task = Task::new("a.mp4", "a.mp4", workdir, "quick", TaskStatus::Queued)
            .trained("a/model.ply");
        h.store.create(&task).await.unwrap();

        let outcome = h.orchestrator.cancel(task.id).await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::AlreadyTerminal {
                status: TaskStatus::Trained
            }
        );
        let view = h.orchestrator.status(task.id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Trained);
    }

    #[tokio::test]
    async fn test_recover_fails_stale_tasks() {
        let h = harness().await;
        let workdir = h.dir.path().join("a");
        let stale = Task::new("a.mp4", "a.mp4", workdir, "quick", TaskStatus::Pending);
        h.store.create(&stale).await.unwrap();
        h.store
            .update(stale.id, &TaskPatch::advance(TaskStatus::Pending, TaskStatus::Imaged))
            .await
            .unwrap();

        let report = h.orchestrator.recover().await.unwrap();
        assert_eq!(report.interrupted, vec![stale.id]);
        assert!(report.admitted.is_empty());

        let task = h.orchestrator.task(stale.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure.as_deref(), Some(INTERRUPTED_REASON));
    }

    #[tokio::test]
    async fn test_second_instance_cannot_recover_a_store_in_use() {
        let h = harness().await;
        h.orchestrator.recover().await.unwrap();

        let running = Task::new(
            "a.mp4",
            "a.mp4",
            h.dir.path().join("a"),
            "quick",
            TaskStatus::Pending,
        );
        h.store.create(&running).await.unwrap();

        let other = orchestrator_on(h.dir.path(), h.store.clone());
        let err = other.recover().await.unwrap_err();
        assert!(
            matches!(err, OrchestratorError::InstanceRunning { pid } if pid == std::process::id())
        );
        let task = h.store.get(running.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        h.orchestrator.shutdown().await;
        let report = other.recover().await.unwrap();
        assert_eq!(report.interrupted, vec![running.id]);
    }

    #[tokio::test]
    async fn test_lease_of_exited_process_is_taken_over() {
        let h = harness().await;
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let gone_pid = child.id();
        child.wait().unwrap();

        let gone = InstanceLease {
            owner: "previous-run".to_string(),
            pid: gone_pid,
        };
        let claimed = h
            .store
            .claim_lease(&LeaseClaim::new(&gone, Duration::from_secs(600)))
            .await
            .unwrap();
        assert_eq!(claimed, LeaseState::Granted);

        h.orchestrator.recover().await.unwrap();
        let fresh = InstanceLease::for_current_process();
        let state = h
            .store
            .claim_lease(&LeaseClaim::new(&fresh, Duration::from_secs(600)))
            .await
            .unwrap();
        assert!(matches!(state, LeaseState::Held(holder) if holder.owner != gone.owner));
    }

    #[tokio::test]
    async fn test_adopt_requires_artifact() {
        let h = harness().await;
        let done = h.dir.path().join("done");
        std::fs::create_dir_all(&done).unwrap();

        let err = h.orchestrator.adopt("clip.mp4", None, &done).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ArtifactNotFound(_)));

        std::fs::write(done.join("model.ply"), b"ply").unwrap();
        let task = h.orchestrator.adopt("clip.mp4", None, &done).await.unwrap();
        assert_eq!(task.status, TaskStatus::Trained);
        assert_eq!(task.result_ref.as_deref(), Some("done/model.ply"));

        let again = h.orchestrator.submit("clip.mp4", None).await.unwrap();
        assert_eq!(again.id, task.id);
    }

    #[tokio::test]
    async fn test_relative_work_root_renders_absolute_stage_paths() {
        let inputs = TempDir::new().unwrap();
        std::fs::write(inputs.path().join("clip.mp4"), b"video").unwrap();
        let variants = inputs.path().join("variants.yaml");
        std::fs::write(
            &variants,
            r#"
variants:
  rel:
    frames:
      program: sh
      args: ["-c", "touch {{frames_dir}}/0001.jpg"]
    train:
      program: sh
      args: ["-c", "mkdir -p {{results_dir}} && touch {{results_dir}}/model.ply"]
      cwd: "{{toolkit_dir}}"
    artifact: model.ply
"#,
        )
        .unwrap();

        let work = tempfile::Builder::new()
            .prefix("recon-rel-work")
            .tempdir_in(".")
            .unwrap();
        let relative = PathBuf::from(work.path().file_name().unwrap());
        assert!(relative.is_relative());

        let config = OrchestratorConfig::new()
            .with_work_root(&relative)
            .with_toolkit_dir(inputs.path())
            .with_variants_file(&variants)
            .with_default_variant("rel")
            .with_status_poll_interval(Duration::from_millis(50));
        let store = Arc::new(SqliteTaskStore::open_in_memory().await.unwrap());
        let orchestrator = Orchestrator::new(
            config,
            store,
            Arc::new(PathResolver::with_base(inputs.path())),
            Arc::new(NoDependents),
        )
        .unwrap();

        let task = orchestrator.submit("clip.mp4", None).await.unwrap();
        assert!(task.working_dir.is_absolute());

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let finished = loop {
            let current = orchestrator.task(task.id).await.unwrap();
            if current.status.is_terminal() || std::time::Instant::now() > deadline {
                break current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        assert_eq!(finished.status, TaskStatus::Trained, "{:?}", finished.failure);
        assert!(task.working_dir.join("input/0001.jpg").is_file());
        assert!(task.working_dir.join("results/model.ply").is_file());
    }

    #[test]
    fn test_cancel_outcome_json() {
        let outcome = CancelOutcome::Cancelled {
            previous: TaskStatus::Converted,
            killed_groups: 1,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "cancelled");
        assert_eq!(json["previous"], "converted");
    }
}
