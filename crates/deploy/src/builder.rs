//! Builder for a process-backed [`Branchoff`] orchestrator.
//!
//! This module provides the [`BranchoffBuilder`] struct which wires the deferred
//! queue, the resolver and the concrete collaborators together from [`Settings`],
//! creating the state and workspace directories on the way.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};

use crate::{
    FileRegistry, GitWorkspace, HookNotifier, Orchestrator, PortRange, ProcessSupervisor,
    Resolver, Settings, StateLock, queue::DeferredQueue,
};

/// The orchestrator over local processes, project hooks and the file registry.
pub type Branchoff = Orchestrator<Arc<ProcessSupervisor>, HookNotifier, FileRegistry>;

/// Builder for creating a [`Branchoff`] orchestrator.
///
/// This builder handles:
/// - State and workspace directory creation
/// - Exclusive ownership of the state directory (see [`StateLock`])
/// - Queue configuration (step timeout, activity log size)
/// - Supervisor configuration (git, port range, readiness timeout)
#[derive(Debug, Clone, Default)]
pub struct BranchoffBuilder {
    settings: Settings,
}

impl BranchoffBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from loaded settings.
    pub fn from_settings(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.settings.state_dir = state_dir.into();
        self
    }

    pub fn workspace_root(mut self, workspace_root: impl Into<PathBuf>) -> Self {
        self.settings.workspace_root = Some(workspace_root.into());
        self
    }

    pub fn ports(mut self, ports: PortRange) -> Self {
        self.settings.ports = ports;
        self
    }

    /// Upper bound on a single step. `None` disables it.
    pub fn step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.step_timeout_secs = timeout.map_or(0, |t| t.as_secs().max(1));
        self
    }

    /// Time an instance gets to accept connections. `None` skips the wait.
    pub fn ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.ready_timeout_secs = timeout.map_or(0, |t| t.as_secs().max(1));
        self
    }

    pub fn activity_capacity(mut self, capacity: usize) -> Self {
        self.settings.activity_capacity = capacity;
        self
    }

    pub fn git(mut self, git: impl Into<PathBuf>) -> Self {
        self.settings.git = git.into();
        self
    }

    pub fn clone_retries(mut self, retries: usize) -> Self {
        self.settings.clone_retries = retries;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Build the orchestrator. Must be called from within a tokio runtime, which
    /// runs the queue worker.
    ///
    /// Fails while another orchestrator owns the same state directory.
    pub fn build(self) -> Result<Branchoff> {
        let settings = self.settings;
        settings.validate()?;

        let workspace_root = settings.workspace_root();
        for dir in [&settings.state_dir, &workspace_root] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }

        let state_lock = StateLock::acquire(&settings.state_dir)?;

        tracing::debug!(
            state_dir = %settings.state_dir.display(),
            workspace_root = %workspace_root.display(),
            "Building orchestrator"
        );

        let supervisor = Arc::new(ProcessSupervisor::new(
            GitWorkspace::new(&settings.git, settings.clone_retries),
            settings.ports,
            settings.ready_timeout(),
        )
        .with_state_lock(state_lock));
        let notifier = HookNotifier::new(supervisor.clone());
        let registry = FileRegistry::new(&settings.state_dir);
        let queue = DeferredQueue::spawn(settings.queue_config());

        Ok(Orchestrator::new(
            Resolver::new(workspace_root),
            queue,
            supervisor,
            notifier,
            registry,
        ))
    }
}
