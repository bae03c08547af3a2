//! Per-task cancellation records.
//!
//! Each running task owns one [`TaskCancellation`]: a set-once token and the
//! process groups its stage runner currently has alive. Registration and
//! cancellation take the same per-task lock, and the token is set before the
//! lock is taken, so a group is either signalled by `cancel` or refused at
//! registration. It can never slip through in between.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::task::TaskId;

use super::signal::{terminate_group, Termination};

/// Cancellation signal and live process groups of one task.
#[derive(Debug)]
pub struct TaskCancellation {
    task_id: TaskId,
    token: CancellationToken,
    groups: Mutex<HashSet<i32>>,
}

impl TaskCancellation {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            token: CancellationToken::new(),
            groups: Mutex::new(HashSet::new()),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Registers a live process group.
    ///
    /// Returns `None` when the task is already cancelled; the caller must
    /// then kill the group itself.
    pub fn register(self: &Arc<Self>, pgid: i32) -> Option<ProcessGuard> {
        let mut groups = self.lock_groups();
        if self.token.is_cancelled() {
            return None;
        }
        groups.insert(pgid);
        debug!(task_id = %self.task_id, pgid = pgid, "Registered process group");
        Some(ProcessGuard {
            owner: Arc::clone(self),
            pgid,
        })
    }

    /// Process groups currently registered.
    pub fn live_groups(&self) -> Vec<i32> {
        let mut groups: Vec<i32> = self.lock_groups().iter().copied().collect();
        groups.sort_unstable();
        groups
    }

    fn lock_groups(&self) -> MutexGuard<'_, HashSet<i32>> {
        // The set stays valid even if a holder panicked
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Deregisters a process group when the stage process is gone.
#[derive(Debug)]
pub struct ProcessGuard {
    owner: Arc<TaskCancellation>,
    pgid: i32,
}

impl ProcessGuard {
    pub fn pgid(&self) -> i32 {
        self.pgid
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.owner.lock_groups().remove(&self.pgid);
    }
}

/// What a cancel request did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Whether the task had a live cancellation record.
    pub tracked: bool,
    /// Termination outcome per process group.
    pub groups: Vec<(i32, Termination)>,
}

/// Registry of cancellation records, looked up by task id.
#[derive(Debug)]
pub struct CancellationController {
    tasks: Mutex<HashMap<TaskId, Arc<TaskCancellation>>>,
    grace: Duration,
}

impl CancellationController {
    /// Creates a controller that waits `grace` between SIGTERM and SIGKILL.
    pub fn new(grace: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// Returns the record for `task_id`, creating it if needed.
    ///
    /// Called by the executor when it starts working on a task.
    pub fn begin(&self, task_id: TaskId) -> Arc<TaskCancellation> {
        let mut tasks = self.lock_tasks();
        Arc::clone(
            tasks
                .entry(task_id)
                .or_insert_with(|| Arc::new(TaskCancellation::new(task_id))),
        )
    }

    pub fn get(&self, task_id: TaskId) -> Option<Arc<TaskCancellation>> {
        self.lock_tasks().get(&task_id).cloned()
    }

    /// Drops the record once the executor is done with the task.
    pub fn release(&self, task_id: TaskId) {
        self.lock_tasks().remove(&task_id);
    }

    /// Number of tasks with a live record.
    pub fn tracked(&self) -> usize {
        self.lock_tasks().len()
    }

    /// Cancels `task_id`: sets its token, then terminates every registered
    /// process group (SIGTERM, grace period, SIGKILL).
    ///
    /// Tasks without a record (not started, or already finished) are left
    /// alone; the executor re-checks persisted status before each stage.
    pub async fn cancel(&self, task_id: TaskId) -> CancelReport {
        let Some(record) = self.get(task_id) else {
            return CancelReport::default();
        };

        record.token.cancel();
        let groups = record.live_groups();

        info!(
            task_id = %task_id,
            groups = groups.len(),
            grace_ms = self.grace.as_millis() as u64,
            "Cancelling task process tree"
        );

        let grace = self.grace;
        let outcomes = join_all(groups.iter().map(|&pgid| async move {
            (pgid, terminate_group(pgid, grace).await)
        }))
        .await;

        CancelReport {
            tracked: true,
            groups: outcomes,
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<TaskCancellation>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
