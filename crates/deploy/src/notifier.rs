//! Lifecycle hooks delivered by running project commands.

use std::{process::Stdio, sync::Arc};

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::{
    context::DeploymentContext,
    project::ProjectConfig,
    supervisor::ProcessSupervisor,
    traits::{HookResponse, LifecycleEvent, Notifier},
};

/// Runs the `[hooks]` command of the project file for each lifecycle event.
///
/// Hook arguments are passed as positional shell parameters (`$1`, `$2`, ...).
/// Hooks see the same environment as the main command, with `PORT` set to the
/// first running instance when there is one.
#[derive(Debug, Clone)]
pub struct HookNotifier {
    supervisor: Arc<ProcessSupervisor>,
}

impl HookNotifier {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

impl Notifier for HookNotifier {
    async fn notify(
        &self,
        ctx: &DeploymentContext,
        event: LifecycleEvent,
        args: &[String],
    ) -> Result<HookResponse> {
        if !ctx.dir.is_dir() {
            tracing::debug!(id = %ctx.id, %event, "No workspace, skipping hook");
            return Ok(HookResponse::skipped());
        }

        let project = ProjectConfig::load(&ctx.dir)?;
        let Some(hook) = project.hooks.get(event) else {
            tracing::debug!(id = %ctx.id, %event, "No hook configured");
            return Ok(HookResponse::skipped());
        };

        let port = self.supervisor.port_for(&ctx.id).await;
        tracing::info!(id = %ctx.id, %event, command = hook, "Running hook");

        let output = Command::new("sh")
            .arg("-c")
            .arg(hook)
            .arg("branchoff")
            .args(args)
            .current_dir(&ctx.dir)
            .envs(project.environment(ctx, 0, port))
            .env("BRANCHOFF_EVENT", event.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run `{event}` hook `{hook}`"))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let response = HookResponse {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        };
        tracing::debug!(id = %ctx.id, %event, exit_code = response.exit_code, "Hook finished");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::{
        context::{Mode, ResolveOptions, Resolver},
        project::PROJECT_FILENAME,
        supervisor::PortRange,
        workspace::GitWorkspace,
    };

    fn notifier() -> HookNotifier {
        HookNotifier::new(Arc::new(ProcessSupervisor::new(
            GitWorkspace::new("false", 0),
            PortRange::default(),
            None,
        )))
    }

    fn context(dir: &std::path::Path) -> DeploymentContext {
        Resolver::new(dir)
            .resolve(
                "https://github.com/acme/shop",
                "main",
                ResolveOptions::default().mode(Mode::Local).dir(dir),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_workspace_is_a_noop() {
        let dir = TempDir::new("branchoff-notifier").unwrap();
        let ctx = context(&dir.path().join("gone"));

        let response = notifier()
            .notify(&ctx, LifecycleEvent::Destroy, &[])
            .await
            .unwrap();
        assert_eq!(response, HookResponse::skipped());
    }

    #[tokio::test]
    async fn test_unconfigured_hook_is_a_noop() {
        let dir = TempDir::new("branchoff-notifier").unwrap();
        let ctx = context(dir.path());

        let response = notifier()
            .notify(&ctx, LifecycleEvent::Test, &[])
            .await
            .unwrap();
        assert!(response.succeeded());
    }

    #[tokio::test]
    async fn test_hook_receives_args_and_reports_exit_code() {
        let dir = TempDir::new("branchoff-notifier").unwrap();
        std::fs::write(
            dir.path().join(PROJECT_FILENAME),
            r#"
[hooks]
fail = "echo \"$BRANCHOFF_EVENT $1 $2\"; exit 4"
"#,
        )
        .unwrap();
        let ctx = context(dir.path());

        let response = notifier()
            .notify(
                &ctx,
                LifecycleEvent::Fail,
                &["1".to_string(), "boom".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(response.exit_code, 4);
        assert_eq!(response.output.trim(), "fail 1 boom");
    }
}
