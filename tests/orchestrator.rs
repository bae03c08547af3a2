//! End-to-end tests of the orchestrator with real `sh` stage commands.
//!
//! Each test gets its own scratch directory holding the variants file, the
//! media files, the SQLite database and the work root.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use recon_forge::events::{NoDependents, Notification, Subscription};
use recon_forge::orchestrator::{CancelOutcome, Orchestrator, PathResolver};
use recon_forge::pipeline::OrchestratorConfig;
use recon_forge::storage::{SqliteTaskStore, TaskFilter, TaskStore};
use recon_forge::task::{Task, TaskId, TaskLayout, TaskPatch, TaskStatus};
use recon_forge::OrchestratorError;
use tempfile::TempDir;

const VARIANTS: &str = r#"
variants:
  quick:
    frames:
      program: sh
      args: ["-c", "touch {{frames_dir}}/0001.jpg"]
    convert:
      program: "true"
    train:
      program: sh
      args:
        - "-c"
        - "mkdir -p {{results_dir}} && echo ply > {{results_dir}}/model.ply"
    artifact: model.ply
  slow:
    frames:
      program: "true"
    train:
      program: sh
      args:
        - "-c"
        - "sleep 30 & echo $! >> ../{{task_id}}.pids; echo $$ >> ../{{task_id}}.pids; wait"
    artifact: model.ply
  steady:
    frames:
      program: sh
      args: ["-c", "sleep 0.3; touch {{frames_dir}}/0001.jpg"]
    train:
      program: sh
      args:
        - "-c"
        - "sleep 0.2; mkdir -p {{results_dir}} && echo ply > {{results_dir}}/model.ply"
    artifact: model.ply
  broken:
    frames:
      program: sh
      args: ["-c", "sleep 0.5; echo 'cannot decode input' >&2; exit 2"]
    train:
      program: "true"
    artifact: model.ply
"#;

struct TestEnv {
    dir: TempDir,
    store: Arc<SqliteTaskStore>,
    orchestrator: Orchestrator,
}

impl TestEnv {
    async fn new(slots: usize) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(
            SqliteTaskStore::open(dir.path().join("tasks.db"))
                .await
                .expect("store"),
        );
        let orchestrator = Self::orchestrator(&dir, &store, slots);
        Self {
            dir,
            store,
            orchestrator,
        }
    }

    fn orchestrator(dir: &TempDir, store: &Arc<SqliteTaskStore>, slots: usize) -> Orchestrator {
        let variants = dir.path().join("variants.yaml");
        std::fs::write(&variants, VARIANTS).expect("variants file");

        let config = OrchestratorConfig::new()
            .with_slots(slots)
            .with_work_root(dir.path().join("work"))
            .with_variants_file(variants)
            .with_default_variant("quick")
            .with_grace_period(Duration::from_secs(2))
            .with_status_poll_interval(Duration::from_millis(100))
            .with_store_retry(2, Duration::from_millis(10));

        Orchestrator::new(
            config,
            store.clone(),
            Arc::new(PathResolver::with_base(dir.path().join("media"))),
            Arc::new(NoDependents),
        )
        .expect("orchestrator")
    }

    fn media(&self, name: &str) -> String {
        let media = self.dir.path().join("media");
        std::fs::create_dir_all(&media).expect("media dir");
        std::fs::write(media.join(name), b"not really a video").expect("media file");
        name.to_string()
    }

    fn work_root(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    async fn wait_for_status(&self, id: TaskId, wanted: TaskStatus) -> Task {
        let mut last = None;
        for _ in 0..300 {
            let task = self.orchestrator.task(id).await.expect("task");
            if task.status == wanted {
                return task;
            }
            last = Some(task.status);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {} stuck in {:?}, wanted {}", id, last, wanted);
    }

    /// Pids written by the `slow` variant, once both are present.
    async fn wait_for_pids(&self, id: TaskId) -> Vec<i32> {
        let file = self.work_root().join(format!("{}.pids", id));
        for _ in 0..300 {
            if let Ok(text) = std::fs::read_to_string(&file) {
                let pids: Vec<i32> = text.lines().filter_map(|l| l.trim().parse().ok()).collect();
                if pids.len() == 2 {
                    return pids;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("training stage of {} never started", id);
    }
}

/// A process counts as gone once it no longer exists or is a zombie.
fn process_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next());
            state != Some("Z")
        }
        Err(_) => false,
    }
}

async fn next_task_event(sub: &mut Subscription) -> (TaskId, TaskStatus, Option<String>) {
    loop {
        match tokio::time::timeout(Duration::from_secs(15), sub.recv()).await {
            Ok(Some(Notification::Task(event))) => {
                return (event.task_id, event.status, event.result_ref)
            }
            Ok(Some(Notification::Connected)) => continue,
            other => panic!("expected task event, got {:?}", other),
        }
    }
}

fn dir_exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_runs_through_every_stage() {
    let env = TestEnv::new(1).await;
    let mut sub = env.orchestrator.subscribe();

    let task = env
        .orchestrator
        .submit(&env.media("garden.mp4"), None)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.working_dir.starts_with(env.work_root()));

    let mut seen = Vec::new();
    let result_ref = loop {
        let (id, status, result_ref) = next_task_event(&mut sub).await;
        assert_eq!(id, task.id);
        seen.push(status);
        if status.is_terminal() {
            break result_ref;
        }
    };

    assert_eq!(
        seen,
        vec![
            TaskStatus::Pending,
            TaskStatus::Imaged,
            TaskStatus::Converted,
            TaskStatus::Trained
        ]
    );

    let dir_name = task.working_dir.file_name().unwrap().to_string_lossy();
    let expected = format!("{}/results/model.ply", dir_name);
    assert_eq!(result_ref.as_deref(), Some(expected.as_str()));

    let view = env.orchestrator.status(task.id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Trained);
    assert_eq!(view.result_ref.as_deref(), Some(expected.as_str()));
    assert!(env.work_root().join(&expected).is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_slot_admits_next_after_failure() {
    let env = TestEnv::new(1).await;

    let broken = env
        .orchestrator
        .submit(&env.media("a.mp4"), Some("broken"))
        .await
        .unwrap();
    let queued = env
        .orchestrator
        .submit(&env.media("b.mp4"), Some("quick"))
        .await
        .unwrap();
    assert_eq!(broken.status, TaskStatus::Pending);
    assert_eq!(queued.status, TaskStatus::Queued);

    let failed = env.wait_for_status(broken.id, TaskStatus::Failed).await;
    assert!(failed.failure.unwrap().contains("cannot decode input"));
    assert!(failed.result_ref.is_none());

    let trained = env.wait_for_status(queued.id, TaskStatus::Trained).await;
    assert!(trained.result_ref.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_during_training_kills_process_tree() {
    let env = TestEnv::new(1).await;

    let slow = env
        .orchestrator
        .submit(&env.media("slow.mp4"), Some("slow"))
        .await
        .unwrap();
    let next = env
        .orchestrator
        .submit(&env.media("next.mp4"), Some("quick"))
        .await
        .unwrap();
    assert_eq!(next.status, TaskStatus::Queued);

    let pids = env.wait_for_pids(slow.id).await;
    assert!(pids.iter().all(|&pid| process_alive(pid)));
    assert_eq!(
        env.orchestrator.status(slow.id).await.unwrap().status,
        TaskStatus::Converted
    );

    let outcome = env.orchestrator.cancel(slow.id).await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::Cancelled {
            previous: TaskStatus::Converted,
            killed_groups: 1
        }
    );

    let cancelled = env.orchestrator.task(slow.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert!(cancelled.result_ref.is_none());
    assert!(!dir_exists(&slow.working_dir));
    for pid in pids {
        assert!(!process_alive(pid), "process {} survived cancellation", pid);
    }

    env.wait_for_status(next.id, TaskStatus::Trained).await;

    // Cancelling again changes nothing
    let again = env.orchestrator.cancel(slow.id).await.unwrap();
    assert_eq!(
        again,
        CancelOutcome::AlreadyTerminal {
            status: TaskStatus::Failed
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_queued_task_never_runs() {
    let env = TestEnv::new(1).await;

    let slow = env
        .orchestrator
        .submit(&env.media("slow.mp4"), Some("slow"))
        .await
        .unwrap();
    let queued = env
        .orchestrator
        .submit(&env.media("queued.mp4"), Some("quick"))
        .await
        .unwrap();

    let outcome = env.orchestrator.cancel(queued.id).await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::Cancelled {
            previous: TaskStatus::Queued,
            killed_groups: 0
        }
    );
    assert!(!dir_exists(&queued.working_dir));

    env.orchestrator.cancel(slow.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let task = env.orchestrator.task(queued.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure.as_deref(), Some("cancelled by operator"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_submissions_share_one_task() {
    let env = TestEnv::new(1).await;
    let clip = env.media("clip.mp4");

    let (a, b) = tokio::join!(
        env.orchestrator.submit(&clip, None),
        env.orchestrator.submit(&clip, None)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id, b.id);

    let trained = env.wait_for_status(a.id, TaskStatus::Trained).await;
    let again = env.orchestrator.submit(&clip, None).await.unwrap();
    assert_eq!(again.id, trained.id);
    assert_eq!(again.result_ref, trained.result_ref);

    // A different variant is a different task
    let other = env.orchestrator.submit(&clip, Some("broken")).await.unwrap();
    assert_ne!(other.id, a.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resubmitting_failed_task_starts_fresh() {
    let env = TestEnv::new(1).await;
    let clip = env.media("clip.mp4");

    let first = env.orchestrator.submit(&clip, Some("broken")).await.unwrap();
    env.wait_for_status(first.id, TaskStatus::Failed).await;
    assert!(dir_exists(&first.working_dir));

    let second = env.orchestrator.submit(&clip, Some("broken")).await.unwrap();
    assert_ne!(second.id, first.id);
    assert!(!dir_exists(&first.working_dir));
    assert_ne!(second.working_dir, first.working_dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovery_fails_interrupted_and_admits_queued() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteTaskStore::open(dir.path().join("tasks.db")).await.unwrap());
    let work = dir.path().join("work");

    // State left behind by a process that died mid-training
    let stale_layout = TaskLayout::for_input(&work, Path::new("stale.mp4"), TaskId::new());
    stale_layout.create().unwrap();
    let stale = Task::new(
        "stale.mp4",
        "stale.mp4",
        stale_layout.root(),
        "quick",
        TaskStatus::Pending,
    );
    store.create(&stale).await.unwrap();
    for (from, to) in [
        (TaskStatus::Pending, TaskStatus::Imaged),
        (TaskStatus::Imaged, TaskStatus::Converted),
    ] {
        assert!(store.update(stale.id, &TaskPatch::advance(from, to)).await.unwrap());
    }

    let queued_id = TaskId::new();
    let queued_layout = TaskLayout::for_input(&work, Path::new("queued.mp4"), queued_id);
    queued_layout.create().unwrap();
    let queued = Task::new(
        "queued.mp4",
        "queued.mp4",
        queued_layout.root(),
        "quick",
        TaskStatus::Queued,
    )
    .with_id(queued_id);
    store.create(&queued).await.unwrap();

    let orchestrator = TestEnv::orchestrator(&dir, &store, 1);
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.interrupted, vec![stale.id]);
    assert_eq!(report.admitted, vec![queued.id]);

    let stale = orchestrator.task(stale.id).await.unwrap();
    assert_eq!(stale.status, TaskStatus::Failed);
    assert_eq!(
        stale.failure.as_deref(),
        Some("interrupted by orchestrator restart")
    );

    let env = TestEnv {
        dir,
        store,
        orchestrator,
    };
    let trained = env.wait_for_status(queued.id, TaskStatus::Trained).await;
    assert!(trained.result_ref.is_some());
    assert_eq!(env.store.count(&Default::default()).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_adopt_existing_reconstruction() {
    let env = TestEnv::new(1).await;

    // Toolkit layout with an older checkpoint than the configured artifact
    let done = env.dir.path().join("imported");
    let checkpoint = done.join("results/point_cloud/iteration_7000");
    std::fs::create_dir_all(&checkpoint).unwrap();
    std::fs::write(checkpoint.join("point_cloud.ply"), b"ply").unwrap();

    let clip = env.media("imported.mp4");
    let task = env
        .orchestrator
        .adopt(&clip, Some("3dgs"), &done)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Trained);
    assert_eq!(
        task.result_ref.as_deref(),
        Some("imported/results/point_cloud/iteration_7000/point_cloud.ply")
    );

    let err = env
        .orchestrator
        .adopt(&clip, Some("3dgs"), &done)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkdirInUse(_)));

    let resubmitted = env.orchestrator.submit(&clip, Some("3dgs")).await.unwrap();
    assert_eq!(resubmitted.id, task.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_slots_bound_active_tasks_and_admit_in_order() {
    let env = TestEnv::new(2).await;
    let mut sub = env.orchestrator.subscribe();

    let mut ids = Vec::new();
    for i in 0..6 {
        let task = env
            .orchestrator
            .submit(&env.media(&format!("scene{}.mp4", i)), Some("steady"))
            .await
            .unwrap();
        let expected = if i < 2 {
            TaskStatus::Pending
        } else {
            TaskStatus::Queued
        };
        assert_eq!(task.status, expected, "submission {}", i);
        ids.push(task.id);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let sampler = {
        let store = env.store.clone();
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut peak = 0;
            while !stop.load(Ordering::SeqCst) {
                let active = store.count(&TaskFilter::active()).await.unwrap();
                peak = peak.max(active);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            peak
        })
    };

    let queued = &ids[2..];
    let mut admitted = Vec::new();
    let mut trained = 0;
    while trained < ids.len() {
        let (id, status, _) = next_task_event(&mut sub).await;
        match status {
            TaskStatus::Pending if queued.contains(&id) => admitted.push(id),
            TaskStatus::Trained => trained += 1,
            TaskStatus::Failed => panic!("task {} failed", id),
            _ => {}
        }
    }

    stop.store(true, Ordering::SeqCst);
    let peak = sampler.await.unwrap();
    assert!(peak <= 2, "{} tasks were active at once", peak);
    assert!(peak >= 1);
    assert_eq!(admitted, queued.to_vec());
    assert_eq!(env.store.count(&TaskFilter::active()).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_orchestrator_leaves_running_tasks_alone() {
    let env = TestEnv::new(1).await;
    env.orchestrator.recover().await.unwrap();

    let task = env
        .orchestrator
        .submit(&env.media("long.mp4"), Some("slow"))
        .await
        .unwrap();
    let pids = env.wait_for_pids(task.id).await;

    let second = TestEnv::orchestrator(&env.dir, &env.store, 1);
    let err = second.recover().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InstanceRunning { .. }));

    // Several status polls of the running orchestrator
    tokio::time::sleep(Duration::from_millis(500)).await;
    let current = env.orchestrator.task(task.id).await.unwrap();
    assert_eq!(current.status, TaskStatus::Converted);
    assert!(pids.iter().all(|&pid| process_alive(pid)));

    env.orchestrator.cancel(task.id).await.unwrap();
    assert!(pids.iter().all(|&pid| !process_alive(pid)));
}
