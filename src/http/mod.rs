//! HTTP+JSON surface: one `axum::Router`, one `AppState`, handlers
//! that never construct a `StatusCode` directly — `EngineError`'s
//! `IntoResponse` impl owns that mapping. Shape grounded on
//! `agentkern-arbiter`/`agentkern-gate`'s `Arc<AppState>` +
//! `State<Arc<AppState>>` servers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::domain::{ApprovalRequest, Deployment, MetricsWindow, RegressionReport};
use crate::error::{EngineError, EngineResult};
use crate::notifications::NotificationGateway;
use crate::services::approval::{ApprovalService, ApprovalStatusSnapshot};
use crate::services::deployment::DeploymentController;
use crate::services::metrics::MetricsService;
use crate::services::regression::RegressionDetector;
use crate::services::version_graph::VersionGraph;
use crate::store::Store;

/// `Json<T>` extractor wrapper whose rejection renders the crate's
/// `{error: text}` envelope instead of axum's own plaintext/422 body.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = EngineError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(_) => Err(EngineError::InvalidInput("Invalid JSON".to_string())),
        }
    }
}

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub version_graph: Arc<VersionGraph>,
    pub approval: Arc<ApprovalService>,
    pub metrics: Arc<MetricsService>,
    pub regression: Arc<RegressionDetector>,
    pub deployment: Arc<DeploymentController>,
    pub notifications: Arc<NotificationGateway>,
    pub config: Arc<Config>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/approvals/request", post(request_approval))
        .route("/approvals/{version_id}/approve", post(approve))
        .route("/approvals/{version_id}/reject", post(reject))
        .route("/approvals/{version_id}", get(get_approval_status))
        .route("/approvals/pending", get(list_pending_approvals))
        .route("/deployments", post(create_deployment))
        .route("/deployments/{id}/rollback", post(rollback_deployment))
        .route("/deployments/{id}", get(get_deployment))
        .route("/deployments/agent/{agent_id}", get(deployment_history))
        .route("/deployments/agent/{agent_id}/current", get(current_deployment))
        .route("/metrics/agent/{agent_id}", get(agent_metrics))
        .route("/metrics/deployment/{id}", get(deployment_metrics))
        .route("/regression/evaluate/{deployment_id}", post(evaluate_regression))
        .route("/regression/report/{deployment_id}", get(regression_report))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
    timestamp: DateTime<Utc>,
}

async fn health(State(state): State<Arc<AppState>>) -> impl axum::response::IntoResponse {
    let ok = state.store.ping().await;
    let body = HealthResponse {
        status: if ok { "healthy" } else { "unhealthy" },
        database: if ok { "connected" } else { "unreachable" },
        timestamp: Utc::now(),
    };
    let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

async fn reviewer_or_denied(store: &Arc<dyn Store>, id: Uuid) -> EngineResult<crate::domain::Reviewer> {
    store.get_reviewer(id).await?.ok_or(EngineError::ReviewerNotFound(id))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestApprovalBody {
    version_id: Uuid,
    requested_by: String,
    required_approvals: u32,
    #[serde(default)]
    expires_in_hours: Option<i64>,
}

async fn request_approval(
    State(state): State<Arc<AppState>>,
    AppJson(body): AppJson<RequestApprovalBody>,
) -> EngineResult<(StatusCode, Json<ApprovalRequest>)> {
    let request = state
        .approval
        .request_approval(body.version_id, &body.requested_by, body.required_approvals, body.expires_in_hours)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteBody {
    approver_id: Uuid,
    #[serde(default)]
    reason: Option<String>,
}

async fn approve(
    State(state): State<Arc<AppState>>,
    Path(version_id): Path<Uuid>,
    AppJson(body): AppJson<VoteBody>,
) -> EngineResult<Json<ApprovalStatusSnapshot>> {
    let approver = reviewer_or_denied(&state.store, body.approver_id).await?;
    let snapshot = state.approval.approve(version_id, &approver, body.reason).await?;
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectBody {
    approver_id: Uuid,
    reason: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SuccessBody {
    success: bool,
}

async fn reject(
    State(state): State<Arc<AppState>>,
    Path(version_id): Path<Uuid>,
    AppJson(body): AppJson<RejectBody>,
) -> EngineResult<Json<SuccessBody>> {
    let approver = reviewer_or_denied(&state.store, body.approver_id).await?;
    state.approval.reject(version_id, &approver, body.reason).await?;
    Ok(Json(SuccessBody { success: true }))
}

async fn get_approval_status(
    State(state): State<Arc<AppState>>,
    Path(version_id): Path<Uuid>,
) -> EngineResult<Json<ApprovalStatusSnapshot>> {
    Ok(Json(state.approval.get_status(version_id).await?))
}

async fn list_pending_approvals(
    State(state): State<Arc<AppState>>,
) -> EngineResult<Json<Vec<ApprovalRequest>>> {
    Ok(Json(state.approval.list_pending().await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeploymentBody {
    version_id: Uuid,
    deployed_by: Uuid,
}

async fn create_deployment(
    State(state): State<Arc<AppState>>,
    AppJson(body): AppJson<CreateDeploymentBody>,
) -> EngineResult<(StatusCode, Json<Deployment>)> {
    let actor = reviewer_or_denied(&state.store, body.deployed_by).await?;
    let deployment = state.deployment.deploy(body.version_id, &actor).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollbackBody {
    rolled_back_by: Uuid,
    #[serde(default)]
    reason: Option<String>,
}

async fn rollback_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    AppJson(body): AppJson<RollbackBody>,
) -> EngineResult<Json<Deployment>> {
    let actor = reviewer_or_denied(&state.store, body.rolled_back_by).await?;
    let deployment = state.deployment.rollback(id, &actor, body.reason).await?;
    Ok(Json(deployment))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentDetail {
    deployment: Deployment,
    regression_report: Option<RegressionReport>,
}

async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> EngineResult<Json<DeploymentDetail>> {
    let deployment = state
        .store
        .get_deployment(id)
        .await?
        .ok_or(EngineError::DeploymentNotFound(id))?;
    let regression_report = state.store.get_latest_regression_report(id).await?;
    Ok(Json(DeploymentDetail { deployment, regression_report }))
}

async fn deployment_history(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> EngineResult<Json<Vec<Deployment>>> {
    Ok(Json(state.store.get_deployment_history(&agent_id, 100).await?))
}

async fn current_deployment(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> EngineResult<Json<Deployment>> {
    state
        .store
        .get_current_deployment(&agent_id)
        .await?
        .map(Json)
        .ok_or(EngineError::AgentNotFound(agent_id))
}

async fn agent_metrics(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> EngineResult<Json<MetricsWindow>> {
    let end = Utc::now();
    let start = end - Duration::minutes(60);
    Ok(Json(state.metrics.window_for_agent(&agent_id, start, end).await?))
}

async fn deployment_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> EngineResult<Json<MetricsWindow>> {
    let deployment = state
        .store
        .get_deployment(id)
        .await?
        .ok_or(EngineError::DeploymentNotFound(id))?;
    let window = state
        .metrics
        .window_for_version(deployment.version_id, deployment.deployed_at, Utc::now())
        .await?;
    Ok(Json(window))
}

async fn evaluate_regression(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<Uuid>,
) -> EngineResult<Json<RegressionReport>> {
    Ok(Json(state.regression.evaluate(deployment_id).await?))
}

async fn regression_report(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<Uuid>,
) -> EngineResult<Json<RegressionReport>> {
    state
        .store
        .get_latest_regression_report(deployment_id)
        .await?
        .map(Json)
        .ok_or(EngineError::DeploymentNotFound(deployment_id))
}
