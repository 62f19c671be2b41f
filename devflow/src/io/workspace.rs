//! Filesystem access for a workflow instance's working directory.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::condition::FileProbe;

/// Files a workflow reads and writes: templates, tasks, sub-workflows.
///
/// Relative paths resolve against [`Workspace::root`].
pub trait Workspace {
    fn root(&self) -> &Path;
    fn exists(&self, path: &str) -> bool;
    fn read(&self, path: &str) -> Result<String>;
    /// Write atomically, creating parent directories.
    fn write(&self, path: &str, contents: &str) -> Result<()>;
}

/// Adapter exposing a workspace to the condition evaluator.
pub struct WorkspaceProbe<'a>(pub &'a dyn Workspace);

impl FileProbe for WorkspaceProbe<'_> {
    fn exists(&self, path: &str) -> bool {
        self.0.exists(path)
    }
}

/// Workspace rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct DirWorkspace {
    root: PathBuf,
}

impl DirWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Workspace for DirWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn read(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        fs::read_to_string(&full).with_context(|| format!("read {}", full.display()))
    }

    fn write(&self, path: &str, contents: &str) -> Result<()> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(anyhow!("refusing to write outside the workspace: {path}"));
        }
        let full = self.root.join(relative);
        debug!(path = %full.display(), bytes = contents.len(), "writing workspace file");
        super::write_atomic(&full, contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_and_probe() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = DirWorkspace::new(temp.path());
        assert!(!ws.exists("docs/out.md"));
        ws.write("docs/out.md", "hello").expect("write");
        assert!(ws.exists("docs/out.md"));
        assert!(WorkspaceProbe(&ws).exists("docs/out.md"));
        assert_eq!(ws.read("docs/out.md").expect("read"), "hello");
    }

    #[test]
    fn refuses_to_escape_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = DirWorkspace::new(temp.path().join("inner"));
        assert!(ws.write("../outside.md", "x").is_err());
        assert!(ws.write("/tmp/abs.md", "x").is_err());
    }

    #[test]
    fn read_missing_file_names_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = DirWorkspace::new(temp.path());
        let err = ws.read("tasks/missing.md").unwrap_err();
        assert!(err.to_string().contains("missing.md"));
    }
}
