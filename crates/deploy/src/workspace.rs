//! Git workspaces backing deployment contexts.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result};
use backon::{ExponentialBuilder, Retryable};
use tokio::process::Command;

use crate::context::{DeploymentContext, Mode};

/// Default number of clone retries after the first attempt.
pub const DEFAULT_CLONE_RETRIES: usize = 3;

/// Clones, refreshes and removes the checkout of a context.
///
/// Local-mode contexts point at a checkout the user owns: it is never cloned,
/// pulled or removed.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    git: PathBuf,
    clone_retries: usize,
}

impl Default for GitWorkspace {
    fn default() -> Self {
        Self::new("git", DEFAULT_CLONE_RETRIES)
    }
}

impl GitWorkspace {
    pub fn new(git: impl Into<PathBuf>, clone_retries: usize) -> Self {
        Self {
            git: git.into(),
            clone_retries,
        }
    }

    /// Make sure the context's workspace exists, cloning it if needed.
    pub async fn ensure(&self, ctx: &DeploymentContext) -> Result<()> {
        if ctx.mode == Mode::Local {
            anyhow::ensure!(
                ctx.dir.is_dir(),
                "Local workspace {} does not exist",
                ctx.dir.display()
            );
            return Ok(());
        }

        if ctx.dir.join(".git").exists() {
            tracing::debug!(id = %ctx.id, dir = %ctx.dir.display(), "Workspace already checked out");
            return Ok(());
        }

        if let Some(parent) = ctx.dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_max_times(self.clone_retries);

        (|| self.clone_once(ctx))
            .retry(backoff)
            .notify(|err, after| {
                tracing::warn!(id = %ctx.id, error = ?err, retry_in = ?after, "Clone failed, retrying");
            })
            .await
    }

    async fn clone_once(&self, ctx: &DeploymentContext) -> Result<()> {
        // A failed clone may leave a partial checkout behind.
        if ctx.dir.exists() {
            tokio::fs::remove_dir_all(&ctx.dir)
                .await
                .with_context(|| format!("Failed to clean up {}", ctx.dir.display()))?;
        }

        tracing::info!(id = %ctx.id, uri = %ctx.uri, branch = %ctx.branch, "Cloning workspace");
        self.run(
            None,
            &[
                "clone",
                "--branch",
                &ctx.branch,
                "--single-branch",
                &ctx.uri,
                &ctx.dir.to_string_lossy(),
            ],
        )
        .await
        .map(drop)
    }

    /// Fast-forward the workspace to the tip of its branch.
    pub async fn pull(&self, ctx: &DeploymentContext) -> Result<()> {
        if ctx.mode == Mode::Local {
            tracing::debug!(id = %ctx.id, "Not pulling a local workspace");
            return Ok(());
        }

        tracing::info!(id = %ctx.id, branch = %ctx.branch, "Pulling workspace");
        self.run(Some(&ctx.dir), &["pull", "--ff-only", "origin", &ctx.branch])
            .await
            .map(drop)
    }

    /// Delete the workspace.
    pub async fn remove(&self, ctx: &DeploymentContext) -> Result<()> {
        if ctx.mode == Mode::Local {
            tracing::debug!(id = %ctx.id, "Keeping local workspace");
            return Ok(());
        }
        if !ctx.dir.exists() {
            return Ok(());
        }

        tokio::fs::remove_dir_all(&ctx.dir)
            .await
            .with_context(|| format!("Failed to remove workspace {}", ctx.dir.display()))?;
        tracing::debug!(id = %ctx.id, dir = %ctx.dir.display(), "Workspace removed");
        Ok(())
    }

    /// Url of the `origin` remote of the checkout at `dir`.
    pub async fn current_remote(&self, dir: &Path) -> Result<String> {
        self.run(Some(dir), &["config", "--get", "remote.origin.url"])
            .await
            .context("Failed to read the origin remote")
    }

    /// Branch checked out at `dir`.
    pub async fn current_branch(&self, dir: &Path) -> Result<String> {
        self.run(Some(dir), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .context("Failed to read the current branch")
    }

    async fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut command = Command::new(&self.git);
        command
            .args(args)
            .stdin(Stdio::null())
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.git.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "`git {}` failed ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
