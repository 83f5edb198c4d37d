//! Error taxonomy for the lifecycle orchestrator.
//!
//! Collaborators report failures through `anyhow`. The orchestrator itself
//! classifies outcomes into the typed errors below so callers can branch on them.

use std::time::Duration;

use thiserror::Error;

/// A `(uri, branch)` pair could not be turned into a deployment context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("unable to resolve deployment: missing repository uri")]
    MissingUri,

    #[error("unable to resolve deployment: missing branch")]
    MissingBranch,

    #[error("unable to resolve deployment: unparsable repository uri `{0}`")]
    InvalidUri(String),

    #[error("unable to resolve deployment: unparsable branch `{0}`")]
    InvalidBranch(String),

    #[error("unable to resolve deployment: `{0}` deployments cannot be requested remotely")]
    UnsupportedMode(crate::context::Mode),
}

/// An inbound source-control event was refused before any pipeline ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventRejected {
    #[error("ping event does not have enough information")]
    Ping,

    #[error("ignoring create event for ref type `{0}`")]
    NotABranch(String),

    #[error("unable to resolve uri and branch")]
    Unresolved,

    #[error("webhook signature is missing or invalid")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
}

/// The outcome of a deferred step that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    #[error("step `{label}` failed: {message}")]
    Failed { label: String, message: String },

    #[error("step `{label}` panicked")]
    Panicked { label: String },

    #[error("step `{label}` timed out after {after:?}")]
    TimedOut { label: String, after: Duration },

    #[error("step `{label}` skipped: {cause}")]
    Skipped { label: String, cause: String },

    #[error("step `{label}` was dropped: the deferred queue is closed")]
    QueueClosed { label: String },
}

impl StepFailure {
    /// The label of the step this failure belongs to.
    pub fn label(&self) -> &str {
        match self {
            Self::Failed { label, .. }
            | Self::Panicked { label }
            | Self::TimedOut { label, .. }
            | Self::Skipped { label, .. }
            | Self::QueueClosed { label } => label,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// The `test` hook of a deployment exited with a non-zero code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tests failed with exit code {exit_code}")]
pub struct TestFailure {
    pub exit_code: i32,
    pub output: String,
}

/// Why a pipeline invocation did not reach its intended end state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Step(#[from] StepFailure),

    #[error("skipping deployment: {0}")]
    TestFailed(#[from] TestFailure),
}
