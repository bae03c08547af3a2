//! Task records for the reconstruction orchestrator.
//!
//! A [`Task`] is one reconstruction attempt for an input artifact and an
//! algorithm variant. Its [`TaskStatus`] moves along a fixed graph:
//!
//! ```text
//! queued ──► pending ──► imaged ──► converted ──► trained
//!    │          │           │            │
//!    └──────────┴───────────┴────────────┴──────► failed
//! ```
//!
//! Status changes are expressed as [`TaskPatch`] values, which pair the new
//! status with the expected current one so stores can apply them as a single
//! compare-and-set.

pub mod layout;
pub mod record;

pub use layout::TaskLayout;
pub use record::{Task, TaskId, TaskPatch, TaskStatus, TaskStatusView};

