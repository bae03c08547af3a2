//! Stage runner.
//!
//! A reconstruction runs three external stages per task:
//!
//! | Stage     | Default command                      | Success status |
//! |-----------|--------------------------------------|----------------|
//! | `frames`  | `ffmpeg` frame extraction            | `imaged`       |
//! | `convert` | `convert.py` structure recovery      | `converted`    |
//! | `train`   | `train.py` model training            | `trained`      |
//!
//! Commands are templates grouped into algorithm variants
//! ([`VariantRegistry`]); the [`StageRunner`] spawns a rendered command as a
//! process group and reports its exit.

pub mod command;
pub mod runner;
pub mod variant;

pub use command::{RenderedCommand, StageCommand, StageContext, StageKind};
pub use runner::{OutputTail, StageReport, StageRunner, DEFAULT_TAIL_LINES};
pub use variant::{VariantRegistry, VariantSpec, DEFAULT_ARTIFACT, DEFAULT_VARIANT};
