//! Task pipeline.
//!
//! - [`config`]: orchestrator configuration loaded from the environment
//! - [`transition`]: the single writer of task statuses
//! - [`executor`]: runs admitted tasks through their stages
//! - [`artifact`]: finds the output a training run produced
//!
//! A task moves `pending -> imaged -> converted -> trained`; any non-terminal
//! status may move to `failed`. Every move is a compare-and-set made by
//! [`Transitions`], so the executor, the admission queue, cancellation and
//! restart recovery can race on a task without overwriting each other.

pub mod artifact;
pub mod config;
pub mod executor;
pub mod transition;

pub use artifact::{locate_artifact, LocatedArtifact};
pub use config::{ConfigError, OrchestratorConfig};
pub use executor::{PipelineExecutor, CANCELLED_REASON};
pub use transition::{TransitionOutcome, Transitions};
