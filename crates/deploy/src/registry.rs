//! File-backed ecosystem registry.
//!
//! Persists the set of known deployments at `<state_dir>/ecosystem.toml`. Every
//! operation is a load-modify-write under an exclusive lock on a sibling
//! `ecosystem.lock`, so several processes can share one state directory.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{
    context::{ContextId, DeploymentContext},
    traits::Registry,
};

/// Name of the registry file inside the state directory.
pub const REGISTRY_FILENAME: &str = "ecosystem.toml";

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct EcosystemFile {
    version: u32,
    #[serde(default)]
    contexts: BTreeMap<ContextId, DeploymentContext>,
}

impl Default for EcosystemFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            contexts: BTreeMap::new(),
        }
    }
}

/// [`Registry`] stored as a TOML file.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    /// Registry stored in `state_dir`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(REGISTRY_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn load_from_disk(&self) -> Result<EcosystemFile> {
        if !self.path.exists() {
            return Ok(EcosystemFile::default());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let file: EcosystemFile = toml::from_str(&content)
            .with_context(|| format!("Corrupted ecosystem registry {}", self.path.display()))?;

        anyhow::ensure!(
            file.version == REGISTRY_VERSION,
            "Unsupported ecosystem registry version {} in {}",
            file.version,
            self.path.display()
        );
        Ok(file)
    }

    fn save_to_disk(&self, file: &EcosystemFile) -> Result<()> {
        let content =
            toml::to_string_pretty(file).context("Failed to serialize ecosystem registry")?;

        // Write then rename so readers never see a partial file.
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))
    }

    /// Run `op` while holding the registry lock.
    fn locked<T>(&self, op: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let lock_path = self.lock_path();
        let lock_file = fs::File::create(&lock_path)
            .with_context(|| format!("Failed to create {}", lock_path.display()))?;
        lock_file
            .lock_exclusive()
            .context("Failed to lock the ecosystem registry")?;

        let result = op(self);

        let _ = lock_file.unlock();
        result
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T> + Send + 'static,
    {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.locked(op))
            .await
            .context("Ecosystem registry task panicked")?
    }
}

impl Registry for FileRegistry {
    async fn list_all(&self) -> Result<BTreeMap<ContextId, DeploymentContext>> {
        self.blocking(|registry| Ok(registry.load_from_disk()?.contexts))
            .await
    }

    async fn get(&self, id: &ContextId) -> Result<Option<DeploymentContext>> {
        let id = id.clone();
        self.blocking(move |registry| Ok(registry.load_from_disk()?.contexts.remove(&id)))
            .await
    }

    async fn save(&self, ctx: &DeploymentContext) -> Result<()> {
        anyhow::ensure!(
            ctx.is_persistent(),
            "Refusing to register test deployment {ctx}"
        );

        let ctx = ctx.clone();
        self.blocking(move |registry| {
            let mut file = registry.load_from_disk()?;
            tracing::debug!(id = %ctx.id, "Saving deployment to the ecosystem registry");
            file.contexts.insert(ctx.id.clone(), ctx);
            registry.save_to_disk(&file)
        })
        .await
    }

    async fn remove(&self, id: &ContextId) -> Result<()> {
        let id = id.clone();
        self.blocking(move |registry| {
            let mut file = registry.load_from_disk()?;
            if file.contexts.remove(&id).is_none() {
                return Ok(());
            }
            tracing::debug!(%id, "Removing deployment from the ecosystem registry");
            registry.save_to_disk(&file)
        })
        .await
    }
}
