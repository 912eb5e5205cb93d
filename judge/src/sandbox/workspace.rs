//! Private per-invocation working directory
//!
//! Every execution gets a fresh directory. Files are copied in before the
//! command runs and optionally copied out afterwards; the directory is
//! removed when the workspace is closed or dropped, whatever the outcome.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, warn};

use super::SandboxError;

pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh workspace under `root` (or the system temp directory)
    pub fn create(root: Option<&Path>) -> Result<Self, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("judge-box-");
        let dir = match root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::workspace("failed to create workspace", e))?;

        debug!("Created workspace {:?}", dir.path());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy a directory's files into the workspace
    pub async fn copy_dir_in(&self, source_dir: &Path) -> Result<(), SandboxError> {
        copy_files(source_dir, self.path()).await
    }

    /// Copy the workspace's files out to `dest_dir`
    pub async fn copy_out(&self, dest_dir: &Path) -> Result<(), SandboxError> {
        copy_files(self.path(), dest_dir).await
    }

    /// Remove the workspace, logging rather than failing on error
    pub fn close(self) {
        let path: PathBuf = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Failed to remove workspace {:?}: {}", path, e);
        }
    }
}

/// Copy regular files (not directories) from `from` to `to`
async fn copy_files(from: &Path, to: &Path) -> Result<(), SandboxError> {
    let mut entries = fs::read_dir(from)
        .await
        .map_err(|e| SandboxError::workspace(format!("failed to read {:?}", from), e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SandboxError::workspace(format!("failed to read {:?}", from), e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| SandboxError::workspace("failed to stat entry", e))?;
        // Skip directories (e.g., __pycache__) and anything that isn't a plain file
        if !file_type.is_file() {
            continue;
        }
        let dest = to.join(entry.file_name());
        fs::copy(entry.path(), &dest).await.map_err(|e| {
            SandboxError::workspace(format!("failed to copy {:?} to {:?}", entry.path(), dest), e)
        })?;
    }

    Ok(())
}
