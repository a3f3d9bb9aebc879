//! Project root discovery.
//!
//! The runner anchors the data directory at the git repository root so that
//! records written from a subdirectory land in the same registry the MCP
//! server reads. Discovery walks up from a starting directory looking for a
//! `.git` entry; callers fall back to the working directory when none is
//! found.

use std::path::{Path, PathBuf};

/// Name of the per-project data directory.
pub const DATA_DIR_NAME: &str = ".devrack";

/// Walks up from `start` looking for a `.git` entry. Returns the
/// containing directory, or `None` when the filesystem root is reached.
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(".git").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// The project root for the runner: the enclosing git repository, or the
/// starting directory itself when outside any repository.
pub fn runner_root(cwd: &Path) -> PathBuf {
    find_git_root(cwd).unwrap_or_else(|| cwd.to_path_buf())
}
