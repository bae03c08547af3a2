//! Stage process execution.
//!
//! Each stage runs as the leader of a fresh process group so the whole tree
//! it spawns (python workers, COLMAP, CUDA helpers) can be signalled at once.
//! Output from both pipes is kept in a bounded tail for failure diagnostics.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::{group_alive, terminate_group, TaskCancellation};
use crate::error::StageError;
use crate::task::TaskId;

use super::command::{RenderedCommand, StageKind};

/// Default number of output lines kept per stage.
pub const DEFAULT_TAIL_LINES: usize = 200;

/// How long pipe readers may keep draining after the process exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded ring of the most recent output lines.
#[derive(Debug, Clone, Default)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Lines discarded to stay within capacity.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn render(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

/// Result of a stage that exited successfully.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: StageKind,
    pub exit_code: i32,
    pub output_tail: Vec<String>,
    pub duration: Duration,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

/// Spawns stage commands and waits for them under cancellation.
#[derive(Debug, Clone)]
pub struct StageRunner {
    tail_lines: usize,
    grace: Duration,
    timeout: Option<Duration>,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES, Duration::from_secs(10))
    }
}

impl StageRunner {
    /// Creates a runner keeping `tail_lines` of output and allowing `grace`
    /// between SIGTERM and SIGKILL when it has to stop a process group.
    pub fn new(tail_lines: usize, grace: Duration) -> Self {
        Self {
            tail_lines,
            grace,
            timeout: None,
        }
    }

    /// Sets a watchdog: stages running longer than `timeout` are killed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one stage command to completion.
    ///
    /// The process group is registered with `cancellation` for the lifetime
    /// of the process. If the task is cancelled before registration succeeds,
    /// the group is killed here and `Cancelled` is returned.
    pub async fn run(
        &self,
        task_id: TaskId,
        command: &RenderedCommand,
        cancellation: &Arc<TaskCancellation>,
    ) -> Result<StageReport, StageError> {
        let stage = command.stage;
        if cancellation.is_cancelled() {
            return Err(StageError::Cancelled(stage));
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        info!(
            task_id = %task_id,
            stage = %stage,
            command = %command.command_line(),
            cwd = %command.cwd.display(),
            "Starting stage"
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| StageError::Spawn {
            stage,
            program: command.program.clone(),
            source,
        })?;

        let tail = Arc::new(Mutex::new(OutputTail::new(self.tail_lines)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, task_id, stage, "stdout", Arc::clone(&tail)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, task_id, stage, "stderr", Arc::clone(&tail)));
        }

        let pgid = child.id().map(|pid| pid as i32);
        let _guard = match pgid {
            Some(pgid) => match cancellation.register(pgid) {
                Some(guard) => Some(guard),
                None => {
                    debug!(
                        task_id = %task_id,
                        stage = %stage,
                        "Cancelled before registration"
                    );
                    self.stop_group(&mut child, pgid).await;
                    drain_readers(readers).await;
                    return Err(StageError::Cancelled(stage));
                }
            },
            None => None,
        };

        let watchdog = async {
            match self.timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending::<Duration>().await,
            }
        };

        // Cancellation signals the group, so the exit it causes must not
        // win over the token.
        let outcome = tokio::select! {
            biased;
            _ = cancellation.token().cancelled() => Outcome::Cancelled,
            status = child.wait() => Outcome::Exited(status),
            limit = watchdog => Outcome::TimedOut(limit),
        };

        match outcome {
            Outcome::Exited(status) => {
                // Stragglers left in the group would outlive the stage
                if let Some(pgid) = pgid {
                    if group_alive(pgid) {
                        warn!(
                            task_id = %task_id,
                            stage = %stage,
                            pgid = pgid,
                            "Stage left processes behind"
                        );
                        terminate_group(pgid, self.grace).await;
                    }
                }
                let status = status?;
                drain_readers(readers).await;
                let duration = started.elapsed();
                let code = exit_code(&status);

                if !status.success() && cancellation.is_cancelled() {
                    info!(
                        task_id = %task_id,
                        stage = %stage,
                        exit_code = code,
                        "Stage stopped by cancellation"
                    );
                    Err(StageError::Cancelled(stage))
                } else if status.success() {
                    info!(
                        task_id = %task_id,
                        stage = %stage,
                        duration_ms = duration.as_millis() as u64,
                        "Stage completed"
                    );
                    Ok(StageReport {
                        stage,
                        exit_code: code,
                        output_tail: lock_tail(&tail).lines().map(str::to_string).collect(),
                        duration,
                    })
                } else {
                    warn!(
                        task_id = %task_id,
                        stage = %stage,
                        exit_code = code,
                        duration_ms = duration.as_millis() as u64,
                        "Stage failed"
                    );
                    Err(StageError::Exit {
                        stage,
                        code,
                        tail: lock_tail(&tail).render(),
                    })
                }
            }
            Outcome::Cancelled => {
                info!(task_id = %task_id, stage = %stage, "Stage cancelled");
                if let Some(pgid) = pgid {
                    self.stop_group(&mut child, pgid).await;
                }
                drain_readers(readers).await;
                Err(StageError::Cancelled(stage))
            }
            Outcome::TimedOut(limit) => {
                warn!(
                    task_id = %task_id,
                    stage = %stage,
                    timeout_secs = limit.as_secs(),
                    "Stage exceeded watchdog timeout"
                );
                if let Some(pgid) = pgid {
                    self.stop_group(&mut child, pgid).await;
                }
                drain_readers(readers).await;
                Err(StageError::TimedOut {
                    stage,
                    timeout: limit,
                })
            }
        }
    }

    /// Terminates the group while reaping the leader, so an exited leader
    /// does not linger as a zombie member of the group.
    async fn stop_group(&self, child: &mut Child, pgid: i32) {
        let (_, waited) = tokio::join!(
            terminate_group(pgid, self.grace),
            tokio::time::timeout(self.grace + READER_DRAIN_TIMEOUT, child.wait()),
        );
        match waited {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(pgid = pgid, error = %e, "Failed to reap stage process"),
            Err(_) => {
                warn!(pgid = pgid, "Stage process did not exit after SIGKILL");
                let _ = child.start_kill();
            }
        }
    }
}

fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

fn lock_tail(tail: &Mutex<OutputTail>) -> std::sync::MutexGuard<'_, OutputTail> {
    tail.lock().unwrap_or_else(|e| e.into_inner())
}

fn spawn_reader<R>(
    reader: R,
    task_id: TaskId,
    stage: StageKind,
    stream: &'static str,
    tail: Arc<Mutex<OutputTail>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    debug!(task_id = %task_id, stage = %stage, stream = stream, "{}", line);
                    lock_tail(&tail).push(line);
                }
                Err(e) => {
                    warn!(
                        task_id = %task_id,
                        stage = %stage,
                        stream = stream,
                        error = %e,
                        "Error reading stage output"
                    );
                    break;
                }
            }
        }
    })
}

async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }
}
