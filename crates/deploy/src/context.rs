//! Deployment contexts and the resolver that produces them.
//!
//! A context is the canonical identity of one branch deployment. Its id is derived
//! from the repository uri, the branch and the mode, so resolving the same inputs
//! twice always addresses the same workspace and the same registry entry.

use std::path::{Path, PathBuf};

use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::ResolutionError;

/// Number of hex characters kept from the identity digest.
const CONTEXT_ID_LEN: usize = 16;

/// How a branch deployment is run.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// A long-lived deployment of a branch, tracked in the ecosystem registry.
    #[default]
    Normal,
    /// A throwaway deployment used to run the branch's tests.
    Test,
    /// A deployment of a checkout the user already has on disk.
    Local,
}

impl Mode {
    /// Test deployments live for a single pipeline invocation and are never persisted.
    pub fn is_transient(self) -> bool {
        matches!(self, Mode::Test)
    }
}

/// Stable identity of a deployment context, used as the registry key.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Deref, Display, From,
)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    /// Derive the id for a canonical `(uri, branch, mode)` triple.
    pub fn derive(uri: &str, branch: &str, mode: Mode) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(uri.as_bytes());
        hasher.update(b"\n");
        hasher.update(branch.as_bytes());
        hasher.update(b"\n");
        hasher.update(mode.to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..CONTEXT_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One branch deployment instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentContext {
    pub id: ContextId,
    /// Repository location, in canonical form.
    pub uri: String,
    pub branch: String,
    #[serde(default)]
    pub mode: Mode,
    /// Desired number of running instances. `None` means one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// Workspace the branch is checked out into.
    pub dir: PathBuf,
}

impl DeploymentContext {
    /// Number of instances the supervisor should run for this context.
    pub fn instances(&self) -> u32 {
        self.scale.unwrap_or(1).max(1)
    }

    /// Whether this context may be written to the ecosystem registry.
    pub fn is_persistent(&self) -> bool {
        !self.mode.is_transient()
    }
}

impl std::fmt::Display for DeploymentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} ({}, {})", self.uri, self.branch, self.mode, self.id)
    }
}

/// Optional inputs folded into a resolved context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    pub mode: Option<Mode>,
    pub scale: Option<u32>,
    pub dir: Option<PathBuf>,
}

impl ResolveOptions {
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn scale(mut self, scale: Option<u32>) -> Self {
        self.scale = scale;
        self
    }

    /// Override the workspace directory (used by local mode).
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

/// Turns `(uri, branch, options)` into canonical [`DeploymentContext`]s.
#[derive(Debug, Clone)]
pub struct Resolver {
    workspace_root: PathBuf,
}

impl Resolver {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Resolve a deployment context.
    ///
    /// Resolution is pure: the same inputs always yield the same id and directory.
    pub fn resolve(
        &self,
        uri: &str,
        branch: &str,
        options: ResolveOptions,
    ) -> Result<DeploymentContext, ResolutionError> {
        let uri = canonical_uri(uri)?;
        let branch = canonical_branch(branch)?;
        let mode = options.mode.unwrap_or_default();
        let id = ContextId::derive(&uri, &branch, mode);
        let dir = options
            .dir
            .unwrap_or_else(|| self.workspace_root.join(id.as_str()));

        Ok(DeploymentContext {
            id,
            uri,
            branch,
            mode,
            scale: options.scale,
            dir,
        })
    }
}

fn canonical_uri(uri: &str) -> Result<String, ResolutionError> {
    let uri = uri.trim().trim_end_matches('/');
    if uri.is_empty() {
        return Err(ResolutionError::MissingUri);
    }

    let has_bad_chars = uri.chars().any(|c| c.is_whitespace() || c.is_control());
    if has_bad_chars || !(is_url(uri) || is_scp_remote(uri) || Path::new(uri).is_absolute()) {
        return Err(ResolutionError::InvalidUri(uri.to_string()));
    }

    Ok(uri.to_string())
}

fn is_url(uri: &str) -> bool {
    Url::parse(uri).is_ok_and(|url| url.has_host() || url.scheme() == "file")
}

/// `git@github.com:owner/repo.git` style remotes.
fn is_scp_remote(uri: &str) -> bool {
    match uri.split_once(':') {
        Some((host, path)) => {
            !host.is_empty() && !host.contains('/') && !path.is_empty() && !path.starts_with("//")
        }
        None => false,
    }
}

fn canonical_branch(branch: &str) -> Result<String, ResolutionError> {
    let branch = branch.trim();
    if branch.is_empty() {
        return Err(ResolutionError::MissingBranch);
    }

    let invalid = branch.starts_with('-')
        || branch.contains("..")
        || branch.chars().any(|c| c.is_whitespace() || c.is_control());
    if invalid {
        return Err(ResolutionError::InvalidBranch(branch.to_string()));
    }

    Ok(branch.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> Resolver {
        Resolver::new("/srv/branchoff/workspaces")
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let resolver = resolver();
        let a = resolver
            .resolve("https://github.com/acme/shop", "feature", ResolveOptions::default())
            .unwrap();
        let b = resolver
            .resolve("https://github.com/acme/shop", "feature", ResolveOptions::default())
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(a, b);
        assert_eq!(a.id.len(), CONTEXT_ID_LEN);
    }

    #[test]
    fn test_resolve_defaults() {
        let ctx = resolver()
            .resolve("https://github.com/acme/shop", "main", ResolveOptions::default())
            .unwrap();

        assert_eq!(ctx.mode, Mode::Normal);
        assert_eq!(ctx.scale, None);
        assert_eq!(ctx.instances(), 1);
        assert_eq!(
            ctx.dir,
            PathBuf::from("/srv/branchoff/workspaces").join(ctx.id.as_str())
        );
    }

    #[test]
    fn test_mode_changes_identity() {
        let resolver = resolver();
        let normal = resolver
            .resolve("https://github.com/acme/shop", "main", ResolveOptions::default())
            .unwrap();
        let test = resolver
            .resolve(
                "https://github.com/acme/shop",
                "main",
                ResolveOptions::default().mode(Mode::Test),
            )
            .unwrap();

        assert_ne!(normal.id, test.id);
        assert_ne!(normal.dir, test.dir);
        assert!(!test.is_persistent());
    }

    #[test]
    fn test_trailing_slash_and_whitespace_are_canonicalized() {
        let resolver = resolver();
        let a = resolver
            .resolve(" https://github.com/acme/shop/ ", " main ", ResolveOptions::default())
            .unwrap();
        let b = resolver
            .resolve("https://github.com/acme/shop", "main", ResolveOptions::default())
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(a.uri, "https://github.com/acme/shop");
    }

    #[test]
    fn test_local_mode_dir_override() {
        let ctx = resolver()
            .resolve(
                "git@github.com:acme/shop.git",
                "main",
                ResolveOptions::default().mode(Mode::Local).dir("/home/dev/shop"),
            )
            .unwrap();

        assert_eq!(ctx.dir, PathBuf::from("/home/dev/shop"));
        assert_eq!(ctx.mode, Mode::Local);
    }

    #[test]
    fn test_missing_inputs_are_unresolved() {
        let resolver = resolver();
        assert_eq!(
            resolver.resolve("", "main", ResolveOptions::default()),
            Err(ResolutionError::MissingUri)
        );
        assert_eq!(
            resolver.resolve("https://github.com/acme/shop", "  ", ResolveOptions::default()),
            Err(ResolutionError::MissingBranch)
        );
    }

    #[test]
    fn test_unparsable_inputs_are_unresolved() {
        let resolver = resolver();
        assert!(matches!(
            resolver.resolve("not a uri", "main", ResolveOptions::default()),
            Err(ResolutionError::InvalidUri(_))
        ));
        assert!(matches!(
            resolver.resolve("shop", "main", ResolveOptions::default()),
            Err(ResolutionError::InvalidUri(_))
        ));
        assert!(matches!(
            resolver.resolve("https://github.com/acme/shop", "a..b", ResolveOptions::default()),
            Err(ResolutionError::InvalidBranch(_))
        ));
        assert!(matches!(
            resolver.resolve("https://github.com/acme/shop", "--force", ResolveOptions::default()),
            Err(ResolutionError::InvalidBranch(_))
        ));
    }

    #[test]
    fn test_accepted_uri_forms() {
        let resolver = resolver();
        for uri in [
            "https://github.com/acme/shop",
            "ssh://git@github.com/acme/shop.git",
            "git@github.com:acme/shop.git",
            "file:///srv/repos/shop.git",
            "/srv/repos/shop.git",
        ] {
            assert!(
                resolver.resolve(uri, "main", ResolveOptions::default()).is_ok(),
                "{uri} should resolve"
            );
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("test".parse::<Mode>().unwrap(), Mode::Test);
        assert_eq!("local".parse::<Mode>().unwrap(), Mode::Local);
        assert_eq!(Mode::Normal.to_string(), "normal");
        assert!("staging".parse::<Mode>().is_err());
    }
}
