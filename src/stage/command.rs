//! Stage command templates.
//!
//! A [`StageCommand`] is a program plus argument templates written in Tera
//! syntax. Rendering it against a [`StageContext`] yields the concrete
//! [`RenderedCommand`] the runner spawns. Every argument is rendered
//! separately and passed to the program as-is, without a shell.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

use crate::error::StageError;
use crate::task::{TaskId, TaskLayout, TaskStatus};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Frame extraction from the source media.
    Frames,
    /// Structure recovery over the extracted frames.
    Convert,
    /// Model training.
    Train,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::Frames, StageKind::Convert, StageKind::Train];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Frames => "frames",
            StageKind::Convert => "convert",
            StageKind::Train => "train",
        }
    }

    /// Status reached when this stage succeeds.
    pub fn target_status(&self) -> TaskStatus {
        match self {
            StageKind::Frames => TaskStatus::Imaged,
            StageKind::Convert => TaskStatus::Converted,
            StageKind::Train => TaskStatus::Trained,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command template for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCommand {
    /// Program to execute, looked up on `PATH` unless absolute.
    pub program: String,
    /// Argument templates.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory template. Defaults to the task's working directory.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment variable templates.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl StageCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Renders every template against `ctx`.
    pub fn render(
        &self,
        stage: StageKind,
        ctx: &StageContext,
    ) -> Result<RenderedCommand, StageError> {
        let context = ctx.to_tera();
        let render = |template: &str| {
            Tera::one_off(template, &context, false).map_err(|e| StageError::Render {
                stage,
                message: render_message(&e),
            })
        };

        let program = render(&self.program)?.trim().to_string();
        if program.is_empty() {
            return Err(StageError::Render {
                stage,
                message: "program renders to an empty string".to_string(),
            });
        }

        let args = self
            .args
            .iter()
            .map(|arg| render(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let cwd = match &self.cwd {
            Some(template) => PathBuf::from(render(template)?),
            None => ctx.workdir.clone(),
        };

        let mut env = BTreeMap::new();
        for (key, value) in &self.env {
            env.insert(key.clone(), render(value)?);
        }

        Ok(RenderedCommand {
            stage,
            program,
            args,
            cwd,
            env,
        })
    }
}

// Tera nests the useful part of the message in the error source chain
fn render_message(err: &tera::Error) -> String {
    use std::error::Error as _;

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Values available to stage command templates.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task_id: TaskId,
    pub variant: String,
    pub input: PathBuf,
    pub workdir: PathBuf,
    pub frames_dir: PathBuf,
    pub results_dir: PathBuf,
    pub toolkit_dir: PathBuf,
}

impl StageContext {
    pub fn new(
        task_id: TaskId,
        variant: impl Into<String>,
        input: &Path,
        layout: &TaskLayout,
        toolkit_dir: &Path,
    ) -> Self {
        Self {
            task_id,
            variant: variant.into(),
            input: input.to_path_buf(),
            workdir: layout.root().to_path_buf(),
            frames_dir: layout.frames_dir(),
            results_dir: layout.results_dir(),
            toolkit_dir: toolkit_dir.to_path_buf(),
        }
    }

    fn to_tera(&self) -> Context {
        let mut context = Context::new();
        context.insert("task_id", &self.task_id.to_string());
        context.insert("variant", &self.variant);
        context.insert("input", &self.input.display().to_string());
        context.insert("workdir", &self.workdir.display().to_string());
        context.insert("frames_dir", &self.frames_dir.display().to_string());
        context.insert("results_dir", &self.results_dir.display().to_string());
        context.insert("toolkit_dir", &self.toolkit_dir.display().to_string());
        context
    }
}

/// A fully rendered stage command, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub stage: StageKind,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl RenderedCommand {
    /// Program and arguments joined for logging.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
