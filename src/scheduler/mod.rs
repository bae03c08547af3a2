//! Slot-bounded admission of tasks.
//!
//! ```text
//!   submit ──► AdmissionQueue ──(slot free)──► PipelineExecutor
//!                    │                                │
//!                 (queued)                       (completion)
//!                    ▼                                ▼
//!               task store ◄──── admit_next ◄── scheduler loop
//! ```
//!
//! The queue is persistent: queued tasks live in the task store, so a
//! restarted orchestrator admits them in the same order.

pub mod admission;

pub use admission::AdmissionQueue;
