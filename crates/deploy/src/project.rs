//! Per-workspace project file.
//!
//! A deployed branch describes how to run it in a `branchoff.toml` at the root of
//! its workspace:
//!
//! ```toml
//! main = "npm start"
//!
//! [env]
//! NODE_ENV = "production"
//!
//! [hooks]
//! test = "npm test"
//! destroy = "./scripts/cleanup.sh"
//! ```

use std::{collections::BTreeMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{context::DeploymentContext, traits::LifecycleEvent};

/// Name of the project file inside a workspace.
pub const PROJECT_FILENAME: &str = "branchoff.toml";

/// Hook command per lifecycle event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub create: Option<String>,
    pub test: Option<String>,
    pub update: Option<String>,
    pub destroy: Option<String>,
    pub pass: Option<String>,
    pub fail: Option<String>,
}

impl HooksConfig {
    pub fn get(&self, event: LifecycleEvent) -> Option<&str> {
        let hook = match event {
            LifecycleEvent::Create => &self.create,
            LifecycleEvent::Test => &self.test,
            LifecycleEvent::Update => &self.update,
            LifecycleEvent::Destroy => &self.destroy,
            LifecycleEvent::Pass => &self.pass,
            LifecycleEvent::Fail => &self.fail,
        };
        hook.as_deref().filter(|command| !command.trim().is_empty())
    }
}

/// Contents of `branchoff.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Command that runs one instance of the deployment.
    pub main: Option<String>,
    /// Extra environment for the main command and every hook.
    pub env: BTreeMap<String, String>,
    pub hooks: HooksConfig,
}

impl ProjectConfig {
    /// Load the project file of a workspace. A missing file is an empty project.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(PROJECT_FILENAME);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No project file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// The start command, required to run the deployment.
    pub fn main_command(&self) -> anyhow::Result<&str> {
        self.main
            .as_deref()
            .filter(|command| !command.trim().is_empty())
            .context("Project file does not define a `main` command")
    }

    /// Environment given to the main command and hooks of `ctx`.
    ///
    /// Project variables are applied first so the `BRANCHOFF_*` variables and
    /// `PORT` always reflect the actual deployment.
    pub fn environment(
        &self,
        ctx: &DeploymentContext,
        instance: u32,
        port: Option<u16>,
    ) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("BRANCHOFF_ID".to_string(), ctx.id.to_string());
        env.insert("BRANCHOFF_URI".to_string(), ctx.uri.clone());
        env.insert("BRANCHOFF_BRANCH".to_string(), ctx.branch.clone());
        env.insert("BRANCHOFF_MODE".to_string(), ctx.mode.to_string());
        env.insert("BRANCHOFF_INSTANCE".to_string(), instance.to_string());
        if let Some(port) = port {
            env.insert("PORT".to_string(), port.to_string());
        }
        env
    }
}
