//! Algorithm variants.
//!
//! A variant names the three stage command templates and the path of the
//! artifact training is expected to produce. The built-in `3dgs` variant runs
//! ffmpeg frame extraction followed by the gaussian-splatting toolkit's
//! `convert.py` and `train.py`. Extra variants come from a YAML file:
//!
//! ```yaml
//! variants:
//!   fast:
//!     description: Short training run
//!     frames:
//!       program: ffmpeg
//!       args: ["-y", "-i", "{{input}}", "-vf", "fps=1", "{{frames_dir}}/%04d.jpg"]
//!     train:
//!       program: python
//!       args: ["train.py", "-s", "{{workdir}}", "--iterations", "7000"]
//!       cwd: "{{toolkit_dir}}"
//!     artifact: point_cloud/iteration_7000/point_cloud.ply
//! ```
//!
//! A variant without `convert` skips structure recovery.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::pipeline::ConfigError;

use super::command::{StageCommand, StageKind};

/// Variant used when a submission does not name one.
pub const DEFAULT_VARIANT: &str = "3dgs";

/// Artifact path produced by a default-length gaussian-splatting run.
pub const DEFAULT_ARTIFACT: &str = "point_cloud/iteration_30000/point_cloud.ply";

fn default_artifact() -> String {
    DEFAULT_ARTIFACT.to_string()
}

/// Stage commands and expected artifact of one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub frames: StageCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert: Option<StageCommand>,
    pub train: StageCommand,
    /// Artifact path relative to the results directory.
    #[serde(default = "default_artifact")]
    pub artifact: String,
}

impl VariantSpec {
    /// The built-in gaussian-splatting variant.
    pub fn gaussian_splatting() -> Self {
        Self {
            description: Some("3D gaussian splatting (gaussian-splatting toolkit)".to_string()),
            frames: StageCommand::new("ffmpeg").with_args([
                "-y",
                "-i",
                "{{input}}",
                "-qscale:v",
                "1",
                "-qmin",
                "1",
                "-vf",
                "fps=2",
                "{{frames_dir}}/%04d.jpg",
            ]),
            convert: Some(
                StageCommand::new("python")
                    .with_args(["convert.py", "-s", "{{workdir}}"])
                    .with_cwd("{{toolkit_dir}}"),
            ),
            train: StageCommand::new("python")
                .with_args([
                    "train.py",
                    "-s",
                    "{{workdir}}",
                    "--model_path",
                    "{{results_dir}}",
                ])
                .with_cwd("{{toolkit_dir}}"),
            artifact: DEFAULT_ARTIFACT.to_string(),
        }
    }

    /// Command for `stage`, `None` when the variant skips it.
    pub fn command(&self, stage: StageKind) -> Option<&StageCommand> {
        match stage {
            StageKind::Frames => Some(&self.frames),
            StageKind::Convert => self.convert.as_ref(),
            StageKind::Train => Some(&self.train),
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: format!("variants.{}", name),
            message,
        };

        for stage in StageKind::ALL {
            if let Some(command) = self.command(stage) {
                if command.program.trim().is_empty() {
                    return Err(invalid(format!("{} program is empty", stage)));
                }
            }
        }

        let artifact = Path::new(&self.artifact);
        if self.artifact.trim().is_empty()
            || !artifact
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(invalid(format!(
                "artifact '{}' must be a relative path without '..'",
                self.artifact
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct VariantFile {
    #[serde(default)]
    variants: BTreeMap<String, VariantSpec>,
}

/// Named variants available to submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRegistry {
    variants: BTreeMap<String, VariantSpec>,
}

impl Default for VariantRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VariantRegistry {
    /// Registry holding only the built-in variants.
    pub fn builtin() -> Self {
        let mut variants = BTreeMap::new();
        variants.insert(DEFAULT_VARIANT.to_string(), VariantSpec::gaussian_splatting());
        Self { variants }
    }

    pub fn empty() -> Self {
        Self {
            variants: BTreeMap::new(),
        }
    }

    /// Built-ins overlaid with the variants of a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: VariantFile = serde_yaml::from_str(yaml)?;
        let mut registry = Self::builtin();
        for (name, spec) in file.variants {
            registry.insert(name, spec)?;
        }
        Ok(registry)
    }

    /// Built-ins overlaid with the variants of a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Adds or replaces a variant.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        spec: VariantSpec,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "variants".to_string(),
                message: "variant name is empty".to_string(),
            });
        }
        spec.validate(&name)?;
        self.variants.insert(name, spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&VariantSpec> {
        self.variants.get(name)
    }

    /// Like [`get`](Self::get) but fails for unknown names.
    pub fn resolve(&self, name: &str) -> Result<&VariantSpec, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownVariant(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variants.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariantSpec)> {
        self.variants.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}
