//! HTTP boundary: webhook receiver and operator endpoints.
//!
//! Every handler only decodes its input and starts a pipeline; none of them wait
//! for pipelines to finish.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use branchoff_deploy::{
    ActivityRecord, Branchoff, DEFAULT_BRANCH, DeployRequest, EcosystemEntry, EventRejected,
    GitEvent, Mode, ResolutionError, WebhookPayload, events,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

const EVENT_HEADER: &str = "x-github-event";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    branchoff: Branchoff,
    webhook_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(branchoff: Branchoff, webhook_secret: Option<String>) -> Self {
        Self {
            branchoff,
            webhook_secret: webhook_secret.map(Arc::from),
        }
    }
}

/// Errors returned to HTTP clients.
#[derive(Debug)]
pub enum ApiError {
    Rejected(EventRejected),
    Unresolved(ResolutionError),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<EventRejected> for ApiError {
    fn from(err: EventRejected) -> Self {
        Self::Rejected(err)
    }
}

impl From<ResolutionError> for ApiError {
    fn from(err: ResolutionError) -> Self {
        Self::Unresolved(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Rejected(EventRejected::InvalidSignature) => (
                StatusCode::UNAUTHORIZED,
                EventRejected::InvalidSignature.to_string(),
            ),
            Self::Rejected(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            Self::Unresolved(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal(err) => {
                tracing::error!(error = ?err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(to_ecosystem))
        .route("/test", get(alive))
        .route("/github/postreceive", post(postreceive))
        .route("/ecosystem", get(ecosystem).post(ecosystem))
        .route("/activity", get(activity))
        .route("/deploy", get(to_ecosystem).post(deploy))
        .route("/destroy", get(to_ecosystem).post(destroy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "Listening for webhooks");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = ?e, "Failed to listen for ctrl-c");
            }
        })
        .await
        .context("HTTP server failed")
}

async fn alive() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn to_ecosystem() -> Redirect {
    Redirect::to("/ecosystem")
}

async fn ecosystem(State(state): State<AppState>) -> Result<Json<Vec<EcosystemEntry>>, ApiError> {
    Ok(Json(state.branchoff.ecosystem_status().await?))
}

async fn activity(State(state): State<AppState>) -> Json<Vec<ActivityRecord>> {
    Json(state.branchoff.queue().activity())
}

async fn postreceive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        events::verify_signature(secret, &body, signature)?;
    }

    let name = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let event = name
        .parse::<GitEvent>()
        .unwrap_or_else(|_| GitEvent::Other(name.to_string()));
    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| EventRejected::MalformedPayload(e.to_string()))?;

    match events::normalize(&event, &payload) {
        Ok(Some(dispatch)) => {
            tracing::info!(
                event = event.name(),
                pipeline = %dispatch.kind,
                uri = %dispatch.uri,
                branch = %dispatch.branch,
                "Dispatching webhook event"
            );
            state.branchoff.dispatch(&dispatch)?;
            Ok((StatusCode::ACCEPTED, Json(json!({ "dispatched": dispatch }))).into_response())
        }
        Ok(None) => Ok(Json(json!({ "dispatched": null })).into_response()),
        Err(rejected) => {
            tracing::warn!(event = event.name(), %rejected, "Rejected webhook event");
            Err(rejected.into())
        }
    }
}

/// Form fields shared by `/deploy` and `/destroy`. Empty fields count as absent.
#[derive(Debug, Default, Deserialize)]
struct RequestForm {
    #[serde(default)]
    uri: String,
    branch: Option<String>,
    mode: Option<String>,
    scale: Option<String>,
    update: Option<String>,
}

impl RequestForm {
    fn branch(&self) -> String {
        present(&self.branch).unwrap_or(DEFAULT_BRANCH).to_string()
    }

    fn mode(&self) -> Result<Option<Mode>, ApiError> {
        present(&self.mode)
            .map(|mode| {
                mode.parse::<Mode>()
                    .map_err(|_| ApiError::BadRequest(format!("unknown mode `{mode}`")))
            })
            .transpose()
    }

    fn scale(&self) -> Result<Option<u32>, ApiError> {
        present(&self.scale)
            .map(|scale| {
                scale
                    .parse::<u32>()
                    .map_err(|_| ApiError::BadRequest(format!("invalid scale `{scale}`")))
            })
            .transpose()
    }

    fn update(&self) -> bool {
        matches!(present(&self.update), Some("true" | "on" | "1" | "yes"))
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

async fn deploy(
    State(state): State<AppState>,
    Form(form): Form<RequestForm>,
) -> Result<Redirect, ApiError> {
    let request = DeployRequest {
        uri: form.uri.clone(),
        branch: form.branch(),
        scale: form.scale()?,
        mode: form.mode()?,
        update: form.update(),
    };

    let _ = state.branchoff.deploy(&request)?;
    Ok(Redirect::to("/ecosystem"))
}

async fn destroy(
    State(state): State<AppState>,
    Form(form): Form<RequestForm>,
) -> Result<Redirect, ApiError> {
    let _ = state
        .branchoff
        .destroy(&form.uri, &form.branch(), form.mode()?)?;
    Ok(Redirect::to("/ecosystem"))
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, Result};
    use axum::{
        body::Body,
        http::{Request, header},
    };
    use branchoff_deploy::{ActivityOutcome, BranchoffBuilder, PortRange};
    use tempdir::TempDir;
    use tower::ServiceExt;

    use super::*;

    /// An orchestrator whose git always fails, so pipelines stop at their first step.
    fn test_state(dir: &TempDir, webhook_secret: Option<&str>) -> Result<AppState> {
        let branchoff = BranchoffBuilder::new()
            .state_dir(dir.path())
            .git("false")
            .clone_retries(0)
            .ports(PortRange {
                start: 42000,
                end: 42100,
            })
            .build()?;
        Ok(AppState::new(branchoff, webhook_secret.map(str::to_string)))
    }

    async fn json_body(response: Response) -> Result<serde_json::Value> {
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .context("read response body")?;
        serde_json::from_slice(&body).context("parse JSON body")
    }

    fn webhook(event: &str, body: &str, signature: Option<&str>) -> Result<Request<Body>> {
        let mut request = Request::builder()
            .method("POST")
            .uri("/github/postreceive")
            .header(EVENT_HEADER, event)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        request
            .body(Body::from(body.to_string()))
            .context("build request")
    }

    fn form(uri: &str, body: &str) -> Result<Request<Body>> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .context("build request")
    }

    const PUSH: &str = r#"{
        "ref": "refs/heads/feature",
        "repository": {"html_url": "https://github.com/acme/shop", "default_branch": "main"}
    }"#;

    #[tokio::test]
    async fn test_alive() -> Result<()> {
        let dir = TempDir::new("branchoff-server")?;
        let router = router(test_state(&dir, None)?);

        let request = Request::builder()
            .uri("/test")
            .body(Body::empty())
            .context("build request")?;
        let response = router.oneshot(request).await.map_err(|err| match err {})?;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await?, json!({ "ok": true }));
        Ok(())
    }

    #[tokio::test]
    async fn test_index_redirects_to_ecosystem() -> Result<()> {
        let dir = TempDir::new("branchoff-server")?;
        let router = router(test_state(&dir, None)?);

        for uri in ["/", "/deploy", "/destroy"] {
            let request = Request::builder()
                .uri(uri)
                .body(Body::empty())
                .context("build request")?;
            let response = router
                .clone()
                .oneshot(request)
                .await
                .map_err(|err| match err {})?;

            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(response.headers()[header::LOCATION], "/ecosystem");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_ecosystem() -> Result<()> {
        let dir = TempDir::new("branchoff-server")?;
        let router = router(test_state(&dir, None)?);

        let request = Request::builder()
            .method("POST")
            .uri("/ecosystem")
            .body(Body::empty())
            .context("build request")?;
        let response = router.oneshot(request).await.map_err(|err| match err {})?;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await?, json!([]));
        Ok(())
    }

    #[tokio::test]
    async fn test_deploy_redirects_and_runs_pipeline() -> Result<()> {
        let dir = TempDir::new("branchoff-server")?;
        let state = test_state(&dir, None)?;
        let router = router(state.clone());

        let request = form("/deploy", "uri=https%3A%2F%2Fgithub.com%2Facme%2Fshop&branch=")?;
        let response = router.oneshot(request).await.map_err(|err| match err {})?;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/ecosystem");

        state.branchoff.queue().flush().await;
        let activity = state.branchoff.queue().activity();
        let provision = activity
            .iter()
            .find(|record| record.label == "test#provision")
            .context("test provision step did not run")?;
        assert!(matches!(provision.outcome, ActivityOutcome::Failed(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_deploy_rejects_bad_input() -> Result<()> {
        let dir = TempDir::new("branchoff-server")?;
        let router = router(test_state(&dir, None)?);

        for body in [
            "uri=",
            "uri=https%3A%2F%2Fgithub.com%2Facme%2Fshop&mode=prod",
            "uri=https%3A%2F%2Fgithub.com%2Facme%2Fshop&scale=many",
            "uri=https%3A%2F%2Fgithub.com%2Facme%2Fshop&mode=local",
        ] {
            let response = router
                .clone()
                .oneshot(form("/deploy", body)?)
                .await
                .map_err(|err| match err {})?;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_destroy_redirects() -> Result<()> {
        let dir = TempDir::new("branchoff-server")?;
        let state = test_state(&dir, None)?;
        let router = router(state.clone());

        let request = form(
            "/destroy",
            "uri=https%3A%2F%2Fgithub.com%2Facme%2Fshop&branch=feature",
        )?;
        let response = router.oneshot(request).await.map_err(|err| match err {})?;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        state.branchoff.queue().flush().await;
        let labels: Vec<_> = state
            .branchoff
            .queue()
            .activity()
            .into_iter()
            .map(|record| record.label)
            .collect();
        assert!(labels.contains(&"destroy#teardown".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_dispatch() -> Result<()> {
        let dir = TempDir::new("branchoff-server")?;
        let router = router(test_state(&dir, None)?);

        let response = router
            .clone()
            .oneshot(webhook("push", PUSH, None)?)
            .await
            .map_err(|err| match err {})?;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await?;
        assert_eq!(body["dispatched"]["kind"], "update");
        assert_eq!(body["dispatched"]["branch"], "feature");

        let response = router
            .clone()
            .oneshot(webhook("ping", "{}", None)?)
            .await
            .map_err(|err| match err {})?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(webhook("issues", "{}", None)?)
            .await
            .map_err(|err| match err {})?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await?["dispatched"], serde_json::Value::Null);

        let response = router
            .oneshot(webhook("push", "not json", None)?)
            .await
            .map_err(|err| match err {})?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_signature() -> Result<()> {
        let dir = TempDir::new("branchoff-server")?;
        let router = router(test_state(&dir, Some("s3cret"))?);

        let response = router
            .clone()
            .oneshot(webhook("push", PUSH, None)?)
            .await
            .map_err(|err| match err {})?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let forged = events::sign("other", PUSH.as_bytes())?;
        let response = router
            .clone()
            .oneshot(webhook("push", PUSH, Some(&forged))?)
            .await
            .map_err(|err| match err {})?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let signature = events::sign("s3cret", PUSH.as_bytes())?;
        let response = router
            .oneshot(webhook("push", PUSH, Some(&signature))?)
            .await
            .map_err(|err| match err {})?;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        Ok(())
    }
}
