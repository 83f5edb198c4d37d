//! Source-control event normalization.
//!
//! Maps a webhook event name and its payload to the pipeline it should trigger.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::EventRejected;

/// Prefix of the `X-Hub-Signature-256` header value.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Webhook event names. Anything unknown is carried as [`GitEvent::Other`].
#[derive(Debug, Clone, PartialEq, Eq, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum GitEvent {
    Ping,
    Create,
    Push,
    #[strum(default)]
    Other(String),
}

impl GitEvent {
    pub fn name(&self) -> &str {
        match self {
            GitEvent::Ping => "ping",
            GitEvent::Create => "create",
            GitEvent::Push => "push",
            GitEvent::Other(name) => name,
        }
    }
}

/// The subset of a webhook payload the normalizer reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "ref", default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub ref_type: Option<String>,
    #[serde(default)]
    pub repository: Option<Repository>,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// Pipelines an event can trigger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PipelineKind {
    Create,
    Update,
    Destroy,
}

/// A pipeline to run for an accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub kind: PipelineKind,
    pub uri: String,
    pub branch: String,
}

/// Map an event to the pipeline it should trigger.
///
/// Returns `Ok(None)` for events that are accepted but trigger nothing.
pub fn normalize(
    event: &GitEvent,
    payload: &WebhookPayload,
) -> Result<Option<Dispatch>, EventRejected> {
    let repository = payload.repository.as_ref();
    let mut branch = match payload.git_ref.as_deref() {
        Some(git_ref) => Some(short_ref(git_ref).to_string()),
        None => repository.and_then(|repo| repo.default_branch.clone()),
    };

    let kind = match event {
        GitEvent::Ping => return Err(EventRejected::Ping),
        GitEvent::Create => {
            let ref_type = payload.ref_type.as_deref().unwrap_or_default();
            if ref_type != "branch" {
                return Err(EventRejected::NotABranch(ref_type.to_string()));
            }
            branch = payload.git_ref.clone();
            PipelineKind::Create
        }
        GitEvent::Push if payload.created => PipelineKind::Create,
        GitEvent::Push if payload.deleted => PipelineKind::Destroy,
        GitEvent::Push => PipelineKind::Update,
        GitEvent::Other(name) => {
            tracing::debug!(event = %name, "Ignoring webhook event");
            return Ok(None);
        }
    };

    let uri = repository.and_then(|repo| repo.html_url.clone());
    match (non_empty(uri), non_empty(branch)) {
        (Some(uri), Some(branch)) => Ok(Some(Dispatch { kind, uri, branch })),
        _ => Err(EventRejected::Unresolved),
    }
}

/// Check an `X-Hub-Signature-256` header against the raw request body.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), EventRejected> {
    let signature = header
        .and_then(|value| value.strip_prefix(SIGNATURE_PREFIX))
        .and_then(|hex_digest| hex::decode(hex_digest.trim()).ok())
        .ok_or(EventRejected::InvalidSignature)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| EventRejected::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| EventRejected::InvalidSignature)
}

/// Compute the `X-Hub-Signature-256` header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> anyhow::Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|err| anyhow::anyhow!("Invalid webhook secret: {err}"))?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn short_ref(git_ref: &str) -> &str {
    git_ref.rsplit('/').next().unwrap_or(git_ref)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
