//! Locating the artifact a training run produced.
//!
//! The toolkit writes its output under `results/` in the task directory, but
//! older runs and imported directories use a flat layout. When neither exact
//! path exists, the newest `iteration_<n>` checkpoint holding a file of the
//! same name is taken instead.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::task::layout::RESULTS_DIR;

/// Depth bound for the checkpoint search below the working directory.
const SEARCH_DEPTH: usize = 6;

/// An output artifact found inside a task's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedArtifact {
    /// Absolute (or work-root relative) path of the file.
    pub path: PathBuf,
    /// Path relative to the parent of the working directory, as stored in
    /// the task's `result_ref`.
    pub result_ref: String,
}

/// Finds `artifact` (relative to the results directory) for the task whose
/// working directory is `workdir`.
pub fn locate_artifact(workdir: &Path, artifact: &str) -> Option<LocatedArtifact> {
    let candidates = [workdir.join(RESULTS_DIR).join(artifact), workdir.join(artifact)];
    let path = candidates
        .into_iter()
        .find(|p| p.is_file())
        .or_else(|| newest_checkpoint(workdir, artifact))?;

    Some(LocatedArtifact {
        result_ref: result_ref(workdir, &path),
        path,
    })
}

/// Searches for `<...>/iteration_<n>/<file name>` and returns the one with the
/// highest `n`.
fn newest_checkpoint(workdir: &Path, artifact: &str) -> Option<PathBuf> {
    let file_name = Path::new(artifact).file_name()?;

    WalkDir::new(workdir)
        .max_depth(SEARCH_DEPTH)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == file_name)
        .filter_map(|e| {
            let iteration = e
                .path()
                .parent()
                .and_then(|dir| dir.file_name())
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix("iteration_"))
                .and_then(|n| n.parse::<u64>().ok())?;
            Some((iteration, e.into_path()))
        })
        .max_by_key(|(iteration, _)| *iteration)
        .map(|(_, path)| path)
}

/// `path` relative to the parent of `workdir`, so the reference starts with
/// the working directory's own name.
pub fn result_ref(workdir: &Path, path: &Path) -> String {
    let base = workdir.parent().unwrap_or(workdir);
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
