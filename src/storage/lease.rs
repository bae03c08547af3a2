//! Single-instance lease on a task store.
//!
//! Only one orchestrator may drive a store at a time: recovery fails every
//! active task it does not run itself, which would tear down the tasks of a
//! second live process. The holder renews its heartbeat periodically; a lease
//! whose heartbeat is older than its TTL may be claimed by anyone.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Identity of the orchestrator claiming the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLease {
    /// Unique per orchestrator instance.
    pub owner: String,
    /// Process id of the owner, for liveness checks on the same host.
    pub pid: u32,
}

impl InstanceLease {
    /// Lease identity for an orchestrator living in this process.
    pub fn for_current_process() -> Self {
        Self {
            owner: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
        }
    }
}

/// The instance currently holding a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHolder {
    pub owner: String,
    pub pid: u32,
    pub heartbeat_at: DateTime<Utc>,
}

/// Result of a lease claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    /// The caller holds the lease; its heartbeat was refreshed.
    Granted,
    /// Another instance holds an unexpired lease.
    Held(LeaseHolder),
}

/// A claim on the lease.
#[derive(Debug, Clone)]
pub struct LeaseClaim<'a> {
    pub lease: &'a InstanceLease,
    /// Heartbeats older than this no longer protect the holder.
    pub ttl: Duration,
    /// Owner whose lease may be replaced regardless of its heartbeat, used
    /// once that owner is known to be gone.
    pub evict: Option<&'a str>,
}

impl<'a> LeaseClaim<'a> {
    pub fn new(lease: &'a InstanceLease, ttl: Duration) -> Self {
        Self {
            lease,
            ttl,
            evict: None,
        }
    }

    pub fn evicting(mut self, owner: &'a str) -> Self {
        self.evict = Some(owner);
        self
    }
}
