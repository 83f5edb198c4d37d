//! Process supervisor running deployments as local child processes.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::Mutex,
    task::JoinHandle,
};

use crate::{
    context::{ContextId, DeploymentContext},
    lock::StateLock,
    project::ProjectConfig,
    ready::{port_accepts, wait_until_ready},
    traits::Supervisor,
    workspace::GitWorkspace,
};

/// Default time a started instance gets to accept connections.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Inclusive range of local ports handed out to deployment instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 3000,
            end: 4000,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Lowest port of `range` that is neither `used` nor refused by `is_free`.
pub fn allocate_port(
    range: PortRange,
    used: &HashSet<u16>,
    is_free: impl Fn(u16) -> bool,
) -> Option<u16> {
    (range.start..=range.end).find(|port| !used.contains(port) && is_free(*port))
}

fn can_bind(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// One running process of a deployment.
struct Instance {
    index: u32,
    port: u16,
    child: Child,
    logs: Vec<JoinHandle<()>>,
}

/// A running instance, as reported by [`ProcessSupervisor::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub instance: u32,
    pub port: u16,
    pub pid: Option<u32>,
}

/// Runs the `main` command of each deployment's project file.
///
/// Instances are killed when the supervisor is dropped.
pub struct ProcessSupervisor {
    workspace: GitWorkspace,
    ports: PortRange,
    ready_timeout: Option<Duration>,
    processes: Mutex<HashMap<ContextId, Vec<Instance>>>,
    /// Released after the processes are killed on drop.
    state_lock: Option<StateLock>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("workspace", &self.workspace)
            .field("ports", &self.ports)
            .field("ready_timeout", &self.ready_timeout)
            .field("state_lock", &self.state_lock)
            .finish_non_exhaustive()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let processes = self.processes.get_mut();
        if processes.is_empty() {
            tracing::debug!("No deployment processes to clean up. Exiting.");
            return;
        }

        let count: usize = processes.values().map(Vec::len).sum();
        tracing::debug!(count, "Killing deployment processes...");

        for (id, instances) in processes.drain() {
            for mut instance in instances {
                if let Err(e) = instance.child.start_kill() {
                    tracing::warn!(%id, instance = instance.index, error = ?e, "Failed to kill process");
                }
                instance.logs.iter().for_each(JoinHandle::abort);
            }
        }
    }
}

impl ProcessSupervisor {
    const STOP_TIMEOUT: Duration = Duration::from_secs(5);

    /// `ready_timeout` of `None` skips the readiness wait.
    pub fn new(workspace: GitWorkspace, ports: PortRange, ready_timeout: Option<Duration>) -> Self {
        Self {
            workspace,
            ports,
            ready_timeout,
            processes: Mutex::new(HashMap::new()),
            state_lock: None,
        }
    }

    /// Keep `lock` until this supervisor is dropped.
    pub fn with_state_lock(mut self, lock: StateLock) -> Self {
        self.state_lock = Some(lock);
        self
    }

    pub fn state_lock(&self) -> Option<&StateLock> {
        self.state_lock.as_ref()
    }

    pub fn workspace(&self) -> &GitWorkspace {
        &self.workspace
    }

    /// Running instances per context.
    pub async fn status(&self) -> BTreeMap<ContextId, Vec<InstanceStatus>> {
        self.processes
            .lock()
            .await
            .iter()
            .map(|(id, instances)| {
                let statuses = instances
                    .iter()
                    .map(|instance| InstanceStatus {
                        instance: instance.index,
                        port: instance.port,
                        pid: instance.child.id(),
                    })
                    .collect();
                (id.clone(), statuses)
            })
            .collect()
    }

    /// Port of the first running instance of a context.
    pub async fn port_for(&self, id: &ContextId) -> Option<u16> {
        self.processes
            .lock()
            .await
            .get(id)
            .and_then(|instances| instances.first())
            .map(|instance| instance.port)
    }

    /// Run the main command of `ctx` attached to the current terminal and wait for it.
    ///
    /// Returns the command's exit code.
    pub async fn run_attached(&self, ctx: &DeploymentContext) -> Result<i32> {
        let project = ProjectConfig::load(&ctx.dir)?;
        let main = project.main_command()?;
        let port = self.allocate(&HashSet::new())?;

        tracing::info!(id = %ctx.id, port, command = main, "Running deployment in the foreground");
        let status = Command::new("sh")
            .arg("-c")
            .arg(main)
            .current_dir(&ctx.dir)
            .envs(project.environment(ctx, 0, Some(port)))
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to run `{main}`"))?;

        Ok(status.code().unwrap_or(-1))
    }

    fn allocate(&self, used: &HashSet<u16>) -> Result<u16> {
        allocate_port(self.ports, used, can_bind).with_context(|| {
            format!(
                "No free port left in {}..={}",
                self.ports.start, self.ports.end
            )
        })
    }

    async fn spawn_instance(
        &self,
        ctx: &DeploymentContext,
        project: &ProjectConfig,
        index: u32,
        port: u16,
    ) -> Result<Instance> {
        let main = project.main_command()?;
        tracing::debug!(id = %ctx.id, instance = index, port, command = main, "Spawning instance");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(main)
            .current_dir(&ctx.dir)
            .envs(project.environment(ctx, index, Some(port)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn `{main}` for {ctx}"))?;

        let mut logs = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            logs.push(forward_logs(ctx.id.clone(), index, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            logs.push(forward_logs(ctx.id.clone(), index, "stderr", stderr));
        }

        Ok(Instance {
            index,
            port,
            child,
            logs,
        })
    }

    async fn wait_ready(&self, ctx: &DeploymentContext, instance: &mut Instance) -> Result<()> {
        let Some(timeout) = self.ready_timeout else {
            return Ok(());
        };

        let name = format!("{} instance {} on port {}", ctx.id, instance.index, instance.port);
        let port = instance.port;
        let child = &mut instance.child;
        wait_until_ready(&name, timeout, || {
            let exited = child.try_wait();
            async move {
                if let Some(status) = exited.context("Failed to poll process")? {
                    anyhow::bail!("Process exited before accepting connections ({status})");
                }
                Ok(port_accepts(port).await)
            }
        })
        .await
    }

    async fn stop(id: &ContextId, instances: Vec<Instance>) {
        for mut instance in instances {
            tracing::debug!(%id, instance = instance.index, port = instance.port, "Stopping instance");

            // Ignore errors if already exited
            instance.child.start_kill().ok();
            if tokio::time::timeout(Self::STOP_TIMEOUT, instance.child.wait())
                .await
                .is_err()
            {
                tracing::warn!(%id, instance = instance.index, "Instance did not exit in time");
            }
            instance.logs.iter().for_each(JoinHandle::abort);
        }
    }
}

impl Supervisor for ProcessSupervisor {
    async fn provision(&self, ctx: &DeploymentContext) -> Result<()> {
        self.workspace.ensure(ctx).await
    }

    async fn refresh(&self, ctx: &DeploymentContext) -> Result<()> {
        self.workspace.pull(ctx).await
    }

    async fn start(&self, ctx: &DeploymentContext) -> Result<()> {
        let project = ProjectConfig::load(&ctx.dir)?;
        project.main_command()?;

        let mut spawned = Vec::new();
        {
            let mut processes = self.processes.lock().await;
            if let Some(previous) = processes.remove(&ctx.id) {
                tracing::info!(id = %ctx.id, count = previous.len(), "Restarting deployment");
                Self::stop(&ctx.id, previous).await;
            }

            let mut used: HashSet<u16> = processes
                .values()
                .flatten()
                .map(|instance| instance.port)
                .collect();

            for index in 0..ctx.instances() {
                let launched = match self.allocate(&used) {
                    Ok(port) => self.spawn_instance(ctx, &project, index, port).await,
                    Err(err) => Err(err),
                };

                match launched {
                    Ok(instance) => {
                        used.insert(instance.port);
                        spawned.push(instance);
                    }
                    Err(err) => {
                        Self::stop(&ctx.id, spawned).await;
                        return Err(err).with_context(|| format!("Failed to start {ctx}"));
                    }
                }
            }
        }

        // Readiness is awaited without holding the process table.
        let mut failure = None;
        for instance in spawned.iter_mut() {
            if let Err(err) = self.wait_ready(ctx, instance).await {
                failure = Some(err);
                break;
            }
            tracing::info!(id = %ctx.id, instance = instance.index, port = instance.port, "Instance started");
        }
        if let Some(err) = failure {
            Self::stop(&ctx.id, spawned).await;
            return Err(err).with_context(|| format!("Failed to start {ctx}"));
        }

        self.processes.lock().await.insert(ctx.id.clone(), spawned);
        Ok(())
    }

    async fn teardown(&self, ctx: &DeploymentContext) -> Result<()> {
        let instances = self.processes.lock().await.remove(&ctx.id);
        if let Some(instances) = instances {
            Self::stop(&ctx.id, instances).await;
        }

        self.workspace.remove(ctx).await
    }
}

/// Forward each line of a process stream to the log.
fn forward_logs<R>(id: ContextId, instance: u32, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::debug!(%id, instance, stream, "{line}"),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(%id, instance, stream, error = %e, "Error streaming logs");
                    break;
                }
            }
        }

        tracing::trace!(%id, instance, stream, "Logs stream ended");
    })
}
