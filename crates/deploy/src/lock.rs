//! Exclusive ownership of a state directory.
//!
//! Only one orchestrator, and so one deferred queue, may drive the workspaces,
//! ports and registry of a state directory.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs2::FileExt;

/// Name of the lock file inside the state directory.
pub const STATE_LOCK_FILENAME: &str = "branchoff.lock";

/// Held for the lifetime of the orchestrator owning a state directory.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    file: File,
}

impl StateLock {
    /// Lock `state_dir`, failing if another orchestrator holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(STATE_LOCK_FILENAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                anyhow::bail!(
                    "State directory {} is owned by another running branchoff; send the request to its HTTP endpoints instead",
                    state_dir.display()
                );
            }
            return Err(e).with_context(|| format!("Failed to lock {}", path.display()));
        }

        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Acquired state directory lock");

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = ?e, "Failed to release state directory lock");
        }
    }
}
