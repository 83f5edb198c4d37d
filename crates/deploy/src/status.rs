//! Ecosystem status: registered deployments joined with their running instances.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::Serialize;

use crate::{
    Orchestrator,
    context::{ContextId, DeploymentContext},
    supervisor::{InstanceStatus, ProcessSupervisor},
    traits::{Notifier, Registry},
};

/// One registered deployment and what is running for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EcosystemEntry {
    #[serde(flatten)]
    pub context: DeploymentContext,
    pub instances: Vec<InstanceStatus>,
}

impl EcosystemEntry {
    pub fn running(&self) -> bool {
        !self.instances.is_empty()
    }
}

impl fmt::Display for EcosystemEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports = self
            .instances
            .iter()
            .map(|instance| instance.port.to_string())
            .collect::<Vec<_>>();
        if ports.is_empty() {
            write!(f, "{} [stopped]", self.context)
        } else {
            write!(f, "{} [ports {}]", self.context, ports.join(", "))
        }
    }
}

/// Join registry entries with running instances. Running contexts that are not
/// registered (test deployments) are left out.
pub fn join(
    registered: BTreeMap<ContextId, DeploymentContext>,
    mut running: BTreeMap<ContextId, Vec<InstanceStatus>>,
) -> Vec<EcosystemEntry> {
    registered
        .into_iter()
        .map(|(id, context)| EcosystemEntry {
            context,
            instances: running.remove(&id).unwrap_or_default(),
        })
        .collect()
}

impl<N, R> Orchestrator<Arc<ProcessSupervisor>, N, R>
where
    N: Notifier,
    R: Registry,
{
    /// Registered deployments with their running instances.
    pub async fn ecosystem_status(&self) -> anyhow::Result<Vec<EcosystemEntry>> {
        let registered = self.ecosystem().await?;
        let running = self.supervisor().status().await;
        Ok(join(registered, running))
    }
}
