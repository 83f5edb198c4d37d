//! Collaborator interfaces consumed by the orchestrator.
//!
//! The orchestrator never touches workspaces, processes or the registry directly.
//! It calls these traits from inside deferred steps, which is what makes the serial
//! queue the only mutual-exclusion mechanism those resources need.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::context::{ContextId, DeploymentContext};

/// Lifecycle hooks delivered to a deployment.
#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum LifecycleEvent {
    Create,
    Test,
    Update,
    Destroy,
    Pass,
    Fail,
}

/// What a deployment answered to a lifecycle hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookResponse {
    pub exit_code: i32,
    pub output: String,
}

impl HookResponse {
    /// The answer for a hook that had nothing to run.
    pub fn skipped() -> Self {
        Self::default()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Prepares workspaces and runs deployment processes.
pub trait Supervisor: Send + Sync + 'static {
    /// Make sure the context's workspace exists and is checked out.
    fn provision(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send;

    /// Pull the latest changes into an existing workspace.
    fn refresh(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send;

    /// (Re)start the context's processes.
    fn start(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send;

    /// Stop the context's processes and release its workspace.
    fn teardown(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send;
}

/// Delivers lifecycle hooks into a deployment.
pub trait Notifier: Send + Sync + 'static {
    /// Deliver `event` with positional `args`. Delivering to a deployment that does
    /// not exist is a no-op that answers [`HookResponse::skipped`].
    fn notify(
        &self,
        ctx: &DeploymentContext,
        event: LifecycleEvent,
        args: &[String],
    ) -> impl Future<Output = Result<HookResponse>> + Send;
}

/// The set of known, persisted deployments.
pub trait Registry: Send + Sync + 'static {
    fn list_all(&self)
    -> impl Future<Output = Result<BTreeMap<ContextId, DeploymentContext>>> + Send;

    fn get(&self, id: &ContextId)
    -> impl Future<Output = Result<Option<DeploymentContext>>> + Send;

    /// Insert or replace a context. Test-mode contexts must be refused.
    fn save(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send;

    /// Forget a context. Removing an unknown id succeeds.
    fn remove(&self, id: &ContextId) -> impl Future<Output = Result<()>> + Send;
}

impl<T: Supervisor> Supervisor for Arc<T> {
    fn provision(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send {
        (**self).provision(ctx)
    }

    fn refresh(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send {
        (**self).refresh(ctx)
    }

    fn start(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send {
        (**self).start(ctx)
    }

    fn teardown(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send {
        (**self).teardown(ctx)
    }
}

impl<T: Notifier> Notifier for Arc<T> {
    fn notify(
        &self,
        ctx: &DeploymentContext,
        event: LifecycleEvent,
        args: &[String],
    ) -> impl Future<Output = Result<HookResponse>> + Send {
        (**self).notify(ctx, event, args)
    }
}

impl<T: Registry> Registry for Arc<T> {
    fn list_all(
        &self,
    ) -> impl Future<Output = Result<BTreeMap<ContextId, DeploymentContext>>> + Send {
        (**self).list_all()
    }

    fn get(&self, id: &ContextId) -> impl Future<Output = Result<Option<DeploymentContext>>> + Send {
        (**self).get(id)
    }

    fn save(&self, ctx: &DeploymentContext) -> impl Future<Output = Result<()>> + Send {
        (**self).save(ctx)
    }

    fn remove(&self, id: &ContextId) -> impl Future<Output = Result<()>> + Send {
        (**self).remove(id)
    }
}
