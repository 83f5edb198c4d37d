//! Branch lifecycle pipelines.
//!
//! Each pipeline is a fixed, ordered list of deferred steps over one resolved
//! context. Pipelines submit their steps up front and return a [`PipelineHandle`]
//! that resolves when their last step has run:
//!
//! - create:  test → provision → notify(create) → start
//! - test:    provision → notify(create) → start → notify(test) → notify(pass|fail) → destroy
//! - update:  test → provision → refresh → notify(update) → start
//! - destroy: notify(destroy) → teardown
//! - restore: for every registered context, provision → notify(create) → start
//!
//! Create and update only deploy when the embedded test passes.

mod invocation;

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use serde::Serialize;

pub use invocation::PipelineHandle;
use invocation::{Invocation, first_failure};

use crate::{
    context::{ContextId, DeploymentContext, Mode, ResolveOptions, Resolver},
    error::{PipelineError, ResolutionError, TestFailure},
    events::{Dispatch, PipelineKind},
    queue::{DeferredQueue, StepTicket},
    traits::{LifecycleEvent, Notifier, Registry, Supervisor},
};

/// Options accepted by the create, update and test pipelines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOptions {
    /// Desired number of instances for the deployment.
    pub scale: Option<u32>,
}

/// Branch deployed when a request does not name one.
pub const DEFAULT_BRANCH: &str = "master";

/// An operator request to deploy a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub uri: String,
    pub branch: String,
    pub scale: Option<u32>,
    /// `test` runs the test pipeline only. Local deployments cannot be requested.
    pub mode: Option<Mode>,
    /// Update an existing deployment instead of creating it.
    pub update: bool,
}

impl DeployRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            branch: DEFAULT_BRANCH.to_string(),
            scale: None,
            mode: None,
            update: false,
        }
    }
}

/// The pipeline started for a [`DeployRequest`].
#[must_use = "dropping the handle does not cancel the pipeline"]
pub enum Launched {
    Deployment(PipelineHandle<DeploymentContext>),
    Test(PipelineHandle<TestReport>),
}

/// Options accepted by [`Orchestrator::restore`]. Restore does not use any of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {}

/// Result of a test pipeline run. A non-zero exit code is a failed test run,
/// not a pipeline error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestReport {
    pub exit_code: i32,
    pub output: String,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    fn into_verdict(self) -> Result<(), PipelineError> {
        if self.passed() {
            Ok(())
        } else {
            Err(TestFailure {
                exit_code: self.exit_code,
                output: self.output,
            }
            .into())
        }
    }
}

/// What a restore run did with each registered context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Contexts replayed through provision → notify(create) → start.
    pub replayed: Vec<ContextId>,
    /// Stale test contexts that were destroyed.
    pub purged: Vec<ContextId>,
    /// Contexts whose replay or purge failed, with the reason.
    pub failed: Vec<(ContextId, String)>,
}

/// Drives the lifecycle pipelines over the injected collaborators.
///
/// All work is funnelled through one [`DeferredQueue`]; the orchestrator itself
/// holds no locks.
pub struct Orchestrator<S, N, R> {
    inner: Arc<Inner<S, N, R>>,
}

struct Inner<S, N, R> {
    resolver: Resolver,
    queue: DeferredQueue,
    supervisor: S,
    notifier: N,
    registry: R,
}

impl<S, N, R> Clone for Orchestrator<S, N, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, N, R> std::fmt::Debug for Orchestrator<S, N, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl<S, N, R> Orchestrator<S, N, R>
where
    S: Supervisor,
    N: Notifier,
    R: Registry,
{
    pub fn new(
        resolver: Resolver,
        queue: DeferredQueue,
        supervisor: S,
        notifier: N,
        registry: R,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                queue,
                supervisor,
                notifier,
                registry,
            }),
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    pub fn queue(&self) -> &DeferredQueue {
        &self.inner.queue
    }

    pub fn supervisor(&self) -> &S {
        &self.inner.supervisor
    }

    pub fn notifier(&self) -> &N {
        &self.inner.notifier
    }

    pub fn registry(&self) -> &R {
        &self.inner.registry
    }

    pub fn resolve(
        &self,
        uri: &str,
        branch: &str,
        options: ResolveOptions,
    ) -> Result<DeploymentContext, ResolutionError> {
        self.inner.resolver.resolve(uri, branch, options)
    }

    /// Snapshot of every registered deployment.
    pub async fn ecosystem(&self) -> anyhow::Result<BTreeMap<ContextId, DeploymentContext>> {
        self.inner
            .registry
            .list_all()
            .await
            .context("Failed to read the ecosystem registry")
    }

    /// Run the pipeline an inbound event was mapped to, without waiting for it.
    pub fn dispatch(&self, dispatch: &Dispatch) -> Result<(), ResolutionError> {
        let Dispatch { kind, uri, branch } = dispatch;
        match kind {
            PipelineKind::Create => {
                let _ = self.create(uri, branch, DeployOptions::default())?;
            }
            PipelineKind::Update => {
                let _ = self.update(uri, branch, DeployOptions::default())?;
            }
            PipelineKind::Destroy => {
                let _ = self.destroy(uri, branch, None)?;
            }
        }
        Ok(())
    }

    /// Start the pipeline matching an operator request.
    pub fn deploy(&self, request: &DeployRequest) -> Result<Launched, ResolutionError> {
        let DeployRequest {
            uri,
            branch,
            scale,
            mode,
            update,
        } = request;
        let options = DeployOptions { scale: *scale };

        match mode.unwrap_or_default() {
            Mode::Normal if *update => Ok(Launched::Deployment(self.update(uri, branch, options)?)),
            Mode::Normal => Ok(Launched::Deployment(self.create(uri, branch, options)?)),
            Mode::Test => Ok(Launched::Test(self.test(uri, branch, options)?)),
            Mode::Local => Err(ResolutionError::UnsupportedMode(Mode::Local)),
        }
    }

    /// Test the branch, then deploy it in normal mode if the tests pass.
    pub fn create(
        &self,
        uri: &str,
        branch: &str,
        options: DeployOptions,
    ) -> Result<PipelineHandle<DeploymentContext>, ResolutionError> {
        let test_ctx = self.resolve(uri, branch, test_options(&options))?;
        let ctx = self.resolve(uri, branch, ResolveOptions::default().scale(options.scale))?;
        tracing::info!(context = %ctx, "Creating deployment");

        Ok(self.gated_deploy("create", test_ctx, ctx, LifecycleEvent::Create))
    }

    /// Test the branch, then refresh and restart its normal deployment if the tests pass.
    pub fn update(
        &self,
        uri: &str,
        branch: &str,
        options: DeployOptions,
    ) -> Result<PipelineHandle<DeploymentContext>, ResolutionError> {
        let test_ctx = self.resolve(uri, branch, test_options(&options))?;
        let ctx = self.resolve(uri, branch, ResolveOptions::default().scale(options.scale))?;
        tracing::info!(context = %ctx, "Updating deployment");

        Ok(self.gated_deploy("update", test_ctx, ctx, LifecycleEvent::Update))
    }

    /// Deploy the branch in a transient test context, run its tests and destroy it.
    pub fn test(
        &self,
        uri: &str,
        branch: &str,
        options: DeployOptions,
    ) -> Result<PipelineHandle<TestReport>, ResolutionError> {
        let ctx = self.resolve(uri, branch, test_options(&options))?;
        let (completion, handle) = PipelineHandle::channel("test");
        self.run_test(ctx, move |report| completion.complete(report));
        Ok(handle)
    }

    /// Notify and tear down the deployment of a branch.
    pub fn destroy(
        &self,
        uri: &str,
        branch: &str,
        mode: Option<Mode>,
    ) -> Result<PipelineHandle<()>, ResolutionError> {
        let ctx = self.resolve(
            uri,
            branch,
            ResolveOptions {
                mode,
                ..Default::default()
            },
        )?;
        Ok(self.destroy_context(ctx))
    }

    /// Notify and tear down an already resolved context.
    pub fn destroy_context(&self, ctx: DeploymentContext) -> PipelineHandle<()> {
        tracing::info!(context = %ctx, "Destroying deployment");

        let inv = Invocation::new("destroy", self.inner.queue.clone());
        let (completion, handle) = PipelineHandle::channel("destroy");

        let _ = {
            let (inner, ctx) = (self.inner.clone(), ctx.clone());
            inv.tolerant("notify:destroy", async move {
                let ctx = registered(&inner.registry, ctx).await;
                inner
                    .notifier
                    .notify(&ctx, LifecycleEvent::Destroy, &[])
                    .await
                    .map(drop)
            })
        };

        let teardown = {
            let inner = self.inner.clone();
            inv.step("teardown", async move {
                let ctx = registered(&inner.registry, ctx).await;
                inner
                    .supervisor
                    .teardown(&ctx)
                    .await
                    .with_context(|| format!("Failed to tear down {ctx}"))?;
                inner
                    .registry
                    .remove(&ctx.id)
                    .await
                    .context("Failed to remove deployment from the ecosystem registry")
            })
        };

        let _ = inv.always("callback", async move {
            completion.complete(first_failure([teardown]).await.map_err(Into::into));
            Ok(())
        });

        handle
    }

    /// Replay every registered deployment, purging stale test contexts.
    ///
    /// The registry is read once, up front, and every replay is submitted before
    /// this returns, so replays are queued ahead of any later trigger.
    pub async fn restore(
        &self,
        _options: RestoreOptions,
    ) -> anyhow::Result<PipelineHandle<RestoreReport>> {
        let ecosystem = self.ecosystem().await?;
        let (completion, handle) = PipelineHandle::channel("restore");

        let mut purges = Vec::new();
        let mut replays = Vec::new();
        for (id, ctx) in ecosystem {
            tracing::info!(%id, context = %ctx, "Jumpstarting deployment");

            if ctx.mode.is_transient() {
                purges.push((id, self.destroy_context(ctx)));
            } else {
                let inv = Invocation::new("restore", self.inner.queue.clone());
                replays.push((id, self.deploy_steps(&inv, &ctx, LifecycleEvent::Create)));
            }
        }

        let inv = Invocation::new("restore", self.inner.queue.clone());
        let _ = inv.always("callback", async move {
            let mut report = RestoreReport::default();

            for (id, purge) in purges {
                match purge.wait().await {
                    Ok(()) => report.purged.push(id),
                    Err(err) => report.failed.push((id, err.to_string())),
                }
            }
            for (id, tickets) in replays {
                match first_failure(tickets).await {
                    Ok(()) => report.replayed.push(id),
                    Err(failure) => report.failed.push((id, failure.to_string())),
                }
            }

            tracing::info!(
                replayed = report.replayed.len(),
                purged = report.purged.len(),
                failed = report.failed.len(),
                "Restore finished"
            );
            completion.complete(Ok(report));
            Ok(())
        });

        Ok(handle)
    }

    /// Run the embedded test, then deploy `ctx` from the test's completion step.
    fn gated_deploy(
        &self,
        pipeline: &'static str,
        test_ctx: DeploymentContext,
        ctx: DeploymentContext,
        event: LifecycleEvent,
    ) -> PipelineHandle<DeploymentContext> {
        let (completion, handle) = PipelineHandle::channel(pipeline);
        let this = self.clone();

        self.run_test(test_ctx, move |report| {
            let inv = Invocation::new(pipeline, this.inner.queue.clone());

            let deployment = match report.and_then(TestReport::into_verdict) {
                Ok(()) => {
                    tracing::info!(pipeline, id = %ctx.id, "Tests passed! Deploying branch");
                    Ok(this.deploy_steps(&inv, &ctx, event))
                }
                Err(err) => {
                    tracing::warn!(pipeline, id = %ctx.id, error = %err, "Tests failed! Skipping deployment");
                    Err(err)
                }
            };

            let _ = inv.always("callback", async move {
                let result = match deployment {
                    Ok(tickets) => first_failure(tickets)
                        .await
                        .map(|()| ctx)
                        .map_err(PipelineError::from),
                    Err(err) => Err(err),
                };
                completion.complete(result);
                Ok(())
            });
        });

        handle
    }

    /// Submit the test steps. `then` runs inside the test's last step, after the
    /// test context's destroy pipeline has been queued.
    fn run_test<K>(&self, ctx: DeploymentContext, then: K)
    where
        K: FnOnce(Result<TestReport, PipelineError>) + Send + 'static,
    {
        tracing::info!(context = %ctx, "Testing branch");

        let inv = Invocation::new("test", self.inner.queue.clone());
        let provision = self.provision_step(&inv, &ctx);
        let announce = self.notify_step(
            &inv,
            &ctx,
            LifecycleEvent::Create,
            vec![ctx.mode.to_string()],
        );
        let start = self.start_step(&inv, &ctx);

        let run = {
            let (inner, ctx) = (self.inner.clone(), ctx.clone());
            inv.step("notify:test", async move {
                let response = inner
                    .notifier
                    .notify(&ctx, LifecycleEvent::Test, &[])
                    .await
                    .context("Failed to run the test hook")?;
                tracing::info!(
                    id = %ctx.id,
                    exit_code = response.exit_code,
                    output = %response.output,
                    "Test hook finished"
                );

                let verdict = if response.succeeded() {
                    LifecycleEvent::Pass
                } else {
                    LifecycleEvent::Fail
                };
                let args = vec![response.exit_code.to_string(), response.output.clone()];
                if let Err(err) = inner.notifier.notify(&ctx, verdict, &args).await {
                    tracing::warn!(id = %ctx.id, event = %verdict, error = ?err, "Failed to deliver test verdict");
                }

                Ok(TestReport {
                    exit_code: response.exit_code,
                    output: response.output,
                })
            })
        };

        let this = self.clone();
        let callback_inv = inv.clone();
        let _ = inv.always("teardown", async move {
            // A test deployment never outlives its invocation, pass or fail.
            let _ = this.destroy_context(ctx);

            let _ = callback_inv.always("callback", async move {
                let report = match first_failure([provision, announce, start]).await {
                    Ok(()) => run.outcome().await.map_err(PipelineError::from),
                    Err(failure) => Err(failure.into()),
                };
                then(report);
                Ok(())
            });
            Ok(())
        });
    }

    fn deploy_steps(
        &self,
        inv: &Invocation,
        ctx: &DeploymentContext,
        event: LifecycleEvent,
    ) -> Vec<StepTicket<()>> {
        let mut tickets = vec![self.provision_step(inv, ctx)];
        if event == LifecycleEvent::Update {
            tickets.push(self.refresh_step(inv, ctx));
        }
        tickets.push(self.notify_step(inv, ctx, event, Vec::new()));
        tickets.push(self.start_step(inv, ctx));
        tickets
    }

    fn provision_step(&self, inv: &Invocation, ctx: &DeploymentContext) -> StepTicket<()> {
        let (inner, ctx) = (self.inner.clone(), ctx.clone());
        inv.step("provision", async move {
            inner
                .supervisor
                .provision(&ctx)
                .await
                .with_context(|| format!("Failed to provision {ctx}"))?;

            if ctx.is_persistent() {
                inner
                    .registry
                    .save(&ctx)
                    .await
                    .context("Failed to save deployment to the ecosystem registry")?;
            }
            Ok(())
        })
    }

    fn refresh_step(&self, inv: &Invocation, ctx: &DeploymentContext) -> StepTicket<()> {
        let (inner, ctx) = (self.inner.clone(), ctx.clone());
        inv.step("refresh", async move {
            inner
                .supervisor
                .refresh(&ctx)
                .await
                .with_context(|| format!("Failed to refresh {ctx}"))
        })
    }

    fn start_step(&self, inv: &Invocation, ctx: &DeploymentContext) -> StepTicket<()> {
        let (inner, ctx) = (self.inner.clone(), ctx.clone());
        inv.step("start", async move {
            inner
                .supervisor
                .start(&ctx)
                .await
                .with_context(|| format!("Failed to start {ctx}"))
        })
    }

    fn notify_step(
        &self,
        inv: &Invocation,
        ctx: &DeploymentContext,
        event: LifecycleEvent,
        args: Vec<String>,
    ) -> StepTicket<()> {
        let (inner, ctx) = (self.inner.clone(), ctx.clone());
        inv.step(&format!("notify:{event}"), async move {
            let response = inner
                .notifier
                .notify(&ctx, event, &args)
                .await
                .with_context(|| format!("Failed to deliver `{event}` to {ctx}"))?;
            if !response.succeeded() {
                anyhow::bail!(
                    "`{event}` hook of {ctx} exited with code {}: {}",
                    response.exit_code,
                    response.output.trim()
                );
            }
            Ok(())
        })
    }
}

fn test_options(options: &DeployOptions) -> ResolveOptions {
    ResolveOptions::default()
        .mode(Mode::Test)
        .scale(options.scale)
}

/// The registered version of `ctx` (which may carry a custom workspace), or `ctx`.
async fn registered<R: Registry>(registry: &R, ctx: DeploymentContext) -> DeploymentContext {
    match registry.get(&ctx.id).await {
        Ok(Some(found)) => found,
        Ok(None) => ctx,
        Err(err) => {
            tracing::warn!(id = %ctx.id, error = ?err, "Failed to look up deployment in the ecosystem registry");
            ctx
        }
    }
}
