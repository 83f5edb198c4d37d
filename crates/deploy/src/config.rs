//! Service settings.

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    queue::{DEFAULT_ACTIVITY_CAPACITY, DEFAULT_STEP_TIMEOUT, QueueConfig},
    supervisor::{DEFAULT_READY_TIMEOUT, PortRange},
    workspace::DEFAULT_CLONE_RETRIES,
};

/// The default name of the settings file inside the state directory.
pub const SETTINGS_FILENAME: &str = "settings.toml";

/// Default port of the HTTP boundary.
pub const DEFAULT_LISTEN_PORT: u16 = 3000;

/// Settings of a branchoff instance.
///
/// Timeouts are in seconds; `0` disables the timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Port the HTTP server listens on.
    pub listen_port: u16,
    /// Directory holding the ecosystem registry.
    pub state_dir: PathBuf,
    /// Directory under which workspaces are cloned. Defaults to `<state_dir>/workspaces`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
    pub step_timeout_secs: u64,
    pub ready_timeout_secs: u64,
    /// Number of finished steps kept in the activity log.
    pub activity_capacity: usize,
    /// Shared secret used to verify webhook signatures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    /// Git binary.
    pub git: PathBuf,
    pub clone_retries: usize,
    /// Ports handed out to deployment instances.
    pub ports: PortRange,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            state_dir: default_state_dir(),
            workspace_root: None,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT.as_secs(),
            ready_timeout_secs: DEFAULT_READY_TIMEOUT.as_secs(),
            activity_capacity: DEFAULT_ACTIVITY_CAPACITY,
            webhook_secret: None,
            git: PathBuf::from("git"),
            clone_retries: DEFAULT_CLONE_RETRIES,
            ports: PortRange::default(),
        }
    }
}

impl Settings {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("workspaces"))
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        seconds(self.step_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        seconds(self.ready_timeout_secs)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            step_timeout: self.step_timeout(),
            activity_capacity: self.activity_capacity,
        }
    }

    /// Check the settings for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.ports.start <= self.ports.end,
            "Invalid port range {}..={}",
            self.ports.start,
            self.ports.end
        );
        anyhow::ensure!(
            self.webhook_secret.as_deref() != Some(""),
            "Webhook secret must not be empty"
        );
        Ok(())
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// `<local data dir>/branchoff`, or `./.branchoff` when there is no such directory.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("branchoff"))
        .unwrap_or_else(|| PathBuf::from(".branchoff"))
}
