//! On-disk layout of a task's working directory.
//!
//! ```text
//! <work_root>/<input stem>-<short id>/
//! ├── input/      extracted frames
//! └── results/    training output
//! ```

use std::io;
use std::path::{Path, PathBuf};

use super::TaskId;

/// Sub-directory receiving extracted frames.
pub const FRAMES_DIR: &str = "input";

/// Sub-directory receiving training output.
pub const RESULTS_DIR: &str = "results";

/// Paths of one task's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLayout {
    root: PathBuf,
}

impl TaskLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout for a fresh task: `<work_root>/<input stem>-<short id>`.
    pub fn for_input(work_root: &Path, input_path: &Path, id: TaskId) -> Self {
        let stem = input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(sanitize_stem)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "task".to_string());
        Self::new(work_root.join(format!("{}-{}", stem, id.short())))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.root.join(FRAMES_DIR)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    /// Creates the directory and its frames sub-directory.
    ///
    /// Fails if the directory already exists, so two tasks never share one.
    pub fn create(&self) -> io::Result<()> {
        if let Some(parent) = self.root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir(&self.root)?;
        std::fs::create_dir(self.frames_dir())
    }

    /// Removes the directory tree. A missing directory is not an error.
    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn sanitize_stem(stem: &str) -> String {
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_naming() {
        let id = TaskId::new();
        let layout = TaskLayout::for_input(Path::new("/work"), Path::new("/media/my clip.mp4"), id);

        assert_eq!(
            layout.root(),
            Path::new(&format!("/work/my_clip-{}", id.short()))
        );
        assert_eq!(layout.frames_dir(), layout.root().join("input"));
        assert_eq!(layout.results_dir(), layout.root().join("results"));
    }

    #[test]
    fn test_layout_falls_back_without_stem() {
        let id = TaskId::new();
        let layout = TaskLayout::for_input(Path::new("/work"), Path::new("/"), id);
        assert!(layout.root().ends_with(format!("task-{}", id.short())));
    }

    #[test]
    fn test_create_is_exclusive_and_remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let layout = TaskLayout::new(tmp.path().join("work").join("clip-1234abcd"));

        layout.create().unwrap();
        assert!(layout.frames_dir().is_dir());
        assert!(layout.create().is_err());

        layout.remove().unwrap();
        assert!(!layout.root().exists());
        layout.remove().unwrap();
    }
}
