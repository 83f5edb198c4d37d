//! branchoff-deploy - Branch lifecycle orchestration library.
//!
//! This crate turns source-control events and operator requests into ordered
//! lifecycle pipelines (create, test, update, destroy, restore) over per-branch
//! deployments. Every step of every pipeline runs on one serial [`DeferredQueue`].

mod builder;
pub use builder::{Branchoff, BranchoffBuilder};

mod config;
pub use config::{DEFAULT_LISTEN_PORT, SETTINGS_FILENAME, Settings, default_state_dir};

pub mod context;
pub use context::{ContextId, DeploymentContext, Mode, ResolveOptions, Resolver};

pub mod error;
pub use error::{EventRejected, PipelineError, ResolutionError, StepFailure, TestFailure};

pub mod events;
pub use events::{Dispatch, GitEvent, PipelineKind, WebhookPayload};

mod lock;
pub use lock::{STATE_LOCK_FILENAME, StateLock};

mod notifier;
pub use notifier::HookNotifier;

mod pipeline;
pub use pipeline::{
    DEFAULT_BRANCH, DeployOptions, DeployRequest, Launched, Orchestrator, PipelineHandle,
    RestoreOptions, RestoreReport, TestReport,
};

pub mod project;
pub use project::{PROJECT_FILENAME, ProjectConfig};

pub mod queue;
pub use queue::{ActivityOutcome, ActivityRecord, DeferredQueue, QueueConfig, StepTicket};

mod ready;

mod registry;
pub use registry::{FileRegistry, REGISTRY_FILENAME};

mod status;
pub use status::EcosystemEntry;

mod supervisor;
pub use supervisor::{InstanceStatus, PortRange, ProcessSupervisor};

pub mod traits;
pub use traits::{HookResponse, LifecycleEvent, Notifier, Registry, Supervisor};

mod workspace;
pub use workspace::GitWorkspace;
