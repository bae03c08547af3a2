//! recon-forge: GPU-exclusive reconstruction task orchestrator.
//!
//! Turns uploaded media into trained reconstructions by running frame
//! extraction, structure recovery and model training as supervised process
//! trees, persisting every task's status and publishing each change to live
//! subscribers.

pub mod cancel;
pub mod cli;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod stage;
pub mod storage;
pub mod task;

// Re-export commonly used types
pub use error::{OrchestratorError, StageError};
pub use orchestrator::{CancelOutcome, Orchestrator, RecoveryReport};
pub use pipeline::OrchestratorConfig;
pub use task::{Task, TaskId, TaskStatus, TaskStatusView};
