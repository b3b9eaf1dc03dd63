//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::canary::config::RolloutConfig;
use crate::canary::metrics::MetricSample;
use crate::canary::rollout::CanaryRollout;
use crate::deploy::{DeployRequest, TriggerOutcome};
use crate::errors::AgentError;
use crate::models::deployment::{Deployment, TriggerSource};
use crate::server::state::ServerState;
use crate::triggers::webhook::{classify, WebhookAction};
use crate::utils::{version_info, VersionInfo};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
pub const SECRET_HEADER: &str = "x-agent-secret";

const DEFAULT_LIMIT: usize = 20;

// ================================= ERRORS ======================================= //

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps agent errors onto HTTP status codes
#[derive(Debug)]
pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AgentError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AgentError::ValidationError(_) | AgentError::JsonError(_) => StatusCode::BAD_REQUEST,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::DeploymentInProgress
            | AgentError::Conflict(_)
            | AgentError::InvalidTransition(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected ({}): {}", status.as_u16(), self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse an optional JSON body; an empty body yields the defaults
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, AgentError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

/// Header secret wins over the body field
fn authorize(
    state: &ServerState,
    headers: &HeaderMap,
    body_secret: Option<&str>,
) -> Result<(), AgentError> {
    state.authorize(header_str(headers, SECRET_HEADER).or(body_secret))
}

/// Abbreviated or full hexadecimal commit id
pub fn is_revision(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit())
}

// ============================== HEALTH / VERSION ================================= //

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "pullagent".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> Json<VersionInfo> {
    Json(version_info())
}

// ================================= DEPLOYMENTS ==================================== //

/// Agent status response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub branch: String,
    pub current_revision: Option<String>,
    pub deploying: bool,
    pub running_deployment: Option<Deployment>,
    pub last_deployment: Option<Deployment>,
    pub consecutive_failures: u32,
    pub active_rollouts: Vec<CanaryRollout>,
}

/// Status handler
pub async fn status_handler(State(state): State<Arc<ServerState>>) -> Json<StatusResponse> {
    let app = &state.app;
    Json(StatusResponse {
        branch: app.git.branch().to_string(),
        current_revision: app.store.last_revision(),
        deploying: app.orchestrator.is_deploying(),
        running_deployment: app.store.current(),
        last_deployment: app.store.last_deployment(),
        consecutive_failures: app.store.consecutive_failures(),
        active_rollouts: app.canary.active(),
    })
}

/// `?limit=` query
#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

/// Deployment history response
#[derive(Debug, Serialize)]
pub struct DeploymentsResponse {
    pub deployments: Vec<Deployment>,
    pub total: usize,
}

/// Deployment history handler, most recent first
pub async fn deployments_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LimitQuery>,
) -> Json<DeploymentsResponse> {
    let deployments = state.app.store.history(query.limit());
    let total = deployments.len();
    Json(DeploymentsResponse { deployments, total })
}

/// Accepted trigger response
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AcceptedResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<TriggerOutcome> for AcceptedResponse {
    fn from(outcome: TriggerOutcome) -> Self {
        match outcome {
            TriggerOutcome::Started { id } => Self {
                id: Some(id),
                ..Default::default()
            },
            TriggerOutcome::Queued => Self {
                queued: Some(true),
                ..Default::default()
            },
        }
    }
}

fn accepted(body: AcceptedResponse) -> Response {
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

/// Webhook handler
pub async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.verify_webhook(&body, header_str(&headers, SIGNATURE_HEADER))?;

    let event = header_str(&headers, EVENT_HEADER);
    match classify(event, &body, state.app.git.branch())? {
        WebhookAction::Pong => Ok((
            StatusCode::OK,
            Json(AcceptedResponse {
                message: Some("pong".to_string()),
                ..Default::default()
            }),
        )
            .into_response()),
        WebhookAction::Deploy { revision, pusher } => {
            info!(
                "Push webhook for {} by {}",
                revision.as_deref().unwrap_or("unknown revision"),
                pusher.as_deref().unwrap_or("unknown pusher")
            );
            let outcome = state
                .app
                .orchestrator
                .trigger(DeployRequest::new(TriggerSource::Webhook))?;
            Ok(accepted(outcome.into()))
        }
        WebhookAction::Ignore(reason) => {
            info!("Webhook ignored: {}", reason);
            Ok(accepted(AcceptedResponse {
                message: Some(format!("ignored: {}", reason)),
                ..Default::default()
            }))
        }
    }
}

/// Manual deployment request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployBody {
    pub force: bool,
    pub skip_rollback: bool,
    pub secret: Option<String>,
}

/// Manual deployment handler
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body: DeployBody = parse_body(&body)?;
    authorize(&state, &headers, body.secret.as_deref())?;

    let outcome = state.app.orchestrator.trigger(DeployRequest {
        trigger: TriggerSource::Manual,
        force: body.force,
        skip_rollback: body.skip_rollback,
    })?;
    Ok(accepted(outcome.into()))
}

/// Manual rollback request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollbackBody {
    pub revision: String,
    pub secret: Option<String>,
}

/// Manual rollback handler
pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body: RollbackBody = parse_body(&body)?;
    authorize(&state, &headers, body.secret.as_deref())?;

    let revision = body.revision.trim();
    if !is_revision(revision) {
        return Err(AgentError::ValidationError(format!(
            "revision {:?} is not a 7 to 40 character hex commit id",
            revision
        ))
        .into());
    }

    let id = state.app.orchestrator.rollback_to(revision)?;
    Ok(accepted(AcceptedResponse {
        id: Some(id),
        ..Default::default()
    }))
}

// =================================== CANARY ====================================== //

/// Rollout list response
#[derive(Debug, Serialize)]
pub struct RolloutsResponse {
    pub rollouts: Vec<CanaryRollout>,
    pub total: usize,
}

/// Rollout list handler
pub async fn canary_list_handler(State(state): State<Arc<ServerState>>) -> Json<RolloutsResponse> {
    let rollouts = state.app.canary.list();
    let total = rollouts.len();
    Json(RolloutsResponse { rollouts, total })
}

/// Start a rollout. The body is the rollout configuration itself, so the
/// secret travels in the header.
pub async fn canary_start_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, None)?;
    let config: RolloutConfig = serde_json::from_slice(&body).map_err(AgentError::from)?;

    let rollout = state.app.canary.start(config).await?;
    Ok((StatusCode::CREATED, Json(rollout)).into_response())
}

/// Rollout status handler
pub async fn canary_get_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<CanaryRollout>, ApiError> {
    state
        .app
        .canary
        .get(&id)
        .map(Json)
        .ok_or_else(|| AgentError::NotFound(format!("rollout {}", id)).into())
}

/// Rollout samples response
#[derive(Debug, Serialize)]
pub struct SamplesResponse {
    pub samples: Vec<MetricSample>,
    pub total: usize,
}

/// Recent samples of a rollout
pub async fn canary_metrics_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<SamplesResponse>, ApiError> {
    let samples = state.app.canary.metrics(&id, query.limit())?;
    let total = samples.len();
    Ok(Json(SamplesResponse { samples, total }))
}

/// Optional body of a rollout control call
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CanaryActionBody {
    pub reason: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum CanaryAction {
    Progress,
    Analyze,
    Pause,
    Resume,
    Promote,
    Rollback,
}

async fn canary_action(
    state: &ServerState,
    id: &str,
    headers: &HeaderMap,
    body: &Bytes,
    action: CanaryAction,
) -> Result<Json<CanaryRollout>, ApiError> {
    let body: CanaryActionBody = parse_body(body)?;
    authorize(state, headers, body.secret.as_deref())?;

    let canary = &state.app.canary;
    let rollout = match action {
        CanaryAction::Progress => canary.progress(id).await?,
        CanaryAction::Analyze => canary.analyze(id).await?,
        CanaryAction::Pause => canary.pause(id).await?,
        CanaryAction::Resume => canary.resume(id).await?,
        CanaryAction::Promote => canary.promote(id).await?,
        CanaryAction::Rollback => canary.rollback(id, body.reason).await?,
    };
    Ok(Json(rollout))
}

pub async fn canary_progress_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CanaryRollout>, ApiError> {
    canary_action(&state, &id, &headers, &body, CanaryAction::Progress).await
}

pub async fn canary_analyze_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CanaryRollout>, ApiError> {
    canary_action(&state, &id, &headers, &body, CanaryAction::Analyze).await
}

pub async fn canary_pause_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CanaryRollout>, ApiError> {
    canary_action(&state, &id, &headers, &body, CanaryAction::Pause).await
}

pub async fn canary_resume_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CanaryRollout>, ApiError> {
    canary_action(&state, &id, &headers, &body, CanaryAction::Resume).await
}

pub async fn canary_promote_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CanaryRollout>, ApiError> {
    canary_action(&state, &id, &headers, &body, CanaryAction::Promote).await
}

pub async fn canary_rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CanaryRollout>, ApiError> {
    canary_action(&state, &id, &headers, &body, CanaryAction::Rollback).await
}
