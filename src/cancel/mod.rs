//! Cancellation controller.
//!
//! Holds a per-task cancellation record (token plus live process groups) and
//! performs forceful process-tree termination:
//!
//! 1. set the task's token, which the executor and stage runner observe;
//! 2. SIGTERM every registered process group;
//! 3. wait up to the grace period;
//! 4. SIGKILL whatever is still alive.

pub mod controller;
pub mod signal;

pub use controller::{CancelReport, CancellationController, ProcessGuard, TaskCancellation};
pub use signal::{group_alive, process_alive, terminate_group, Termination};
