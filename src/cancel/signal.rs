//! Process-group signalling.
//!
//! Stage commands are spawned as leaders of their own process group, so a
//! single `killpg` reaches every descendant that did not start a new session.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Interval between liveness checks while waiting for a group to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a process group ended up terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The group was already gone.
    AlreadyExited,
    /// The group exited within the grace period after SIGTERM.
    Graceful,
    /// The group had to be SIGKILLed.
    Killed,
}

fn valid_pgid(pgid: i32) -> bool {
    // 0 and 1 would address our own group or init
    pgid > 1
}

/// Sends `signal` to every process in group `pgid`.
pub fn signal_group(pgid: i32, signal: libc::c_int) -> io::Result<()> {
    if !valid_pgid(pgid) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {}", pgid),
        ));
    }
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Returns whether any process of group `pgid` still exists.
pub fn group_alive(pgid: i32) -> bool {
    if !valid_pgid(pgid) {
        return false;
    }
    match signal_group(pgid, 0) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

/// Returns whether process `pid` exists on this host.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Terminates group `pgid`: SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate_group(pgid: i32, grace: Duration) -> Termination {
    if !group_alive(pgid) {
        return Termination::AlreadyExited;
    }

    if let Err(e) = signal_group(pgid, libc::SIGTERM) {
        if e.raw_os_error() == Some(libc::ESRCH) {
            return Termination::AlreadyExited;
        }
        warn!(pgid = pgid, error = %e, "SIGTERM to process group failed");
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !group_alive(pgid) {
            debug!(pgid = pgid, "Process group exited after SIGTERM");
            return Termination::Graceful;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    if let Err(e) = signal_group(pgid, libc::SIGKILL) {
        if e.raw_os_error() == Some(libc::ESRCH) {
            return Termination::Graceful;
        }
        warn!(pgid = pgid, error = %e, "SIGKILL to process group failed");
    }
    warn!(
        pgid = pgid,
        grace_ms = grace.as_millis() as u64,
        "Process group killed after grace period"
    );
    Termination::Killed
}
