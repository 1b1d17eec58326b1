//! REST API handlers.
//!
//! Each handler calls the `DeploymentService` and maps its result onto the
//! JSON envelope; `DeployError` kinds map onto HTTP statuses.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use terraplane_core::Template;
use terraplane_deploy::{DeleteOutcome, DeployError, NewDeployment, NewProvider};
use tracing::{debug, error};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(msg: String, data: Option<T>) -> Json<Self> {
        Json(Self {
            success: false,
            data,
            error: Some(msg),
        })
    }
}

fn status_of(err: &DeployError) -> StatusCode {
    match err {
        DeployError::BadRequest(_) => StatusCode::BAD_REQUEST,
        DeployError::NotFound(_) => StatusCode::NOT_FOUND,
        DeployError::Conflict(_) => StatusCode::CONFLICT,
        DeployError::QuotaExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DeployError::ExecutionFailed { .. } | DeployError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: DeployError) -> Response {
    let status = status_of(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        debug!(error = %err, %status, "request rejected");
    }
    (status, ApiResponse::<()>::err(err.to_string(), None)).into_response()
}

fn respond<T: serde::Serialize>(result: Result<T, DeployError>, status: StatusCode) -> Response {
    match result {
        Ok(data) => (status, ApiResponse::ok(data)).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/projects/:project/deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    Path(project): Path<String>,
) -> impl IntoResponse {
    respond(state.service.list_deployments(&project), StatusCode::OK)
}

/// POST /api/v1/projects/:project/deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    Json(req): Json<NewDeployment>,
) -> impl IntoResponse {
    respond(state.service.create_deployment(&project, req), StatusCode::CREATED)
}

/// GET /api/v1/deployments/:id
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.service.get_deployment(&id), StatusCode::OK)
}

/// POST /api/v1/deployments/:id/start
pub async fn start_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.service.start_deployment(&id), StatusCode::ACCEPTED)
}

/// Query string of a delete request.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub user: Option<String>,
}

/// DELETE /api/v1/deployments/:id
///
/// A deployment with dependents is refused with 409 unless `force` is set;
/// the dependency report travels in `data`.
pub async fn delete_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> impl IntoResponse {
    let user = params.user.unwrap_or_else(|| "anonymous".to_string());
    match state.service.delete_deployment(&id, &user, params.force) {
        Ok(DeleteOutcome::Deleted) => ApiResponse::ok(DeleteOutcome::Deleted).into_response(),
        Ok(DeleteOutcome::DependencyConflict(report)) => (
            StatusCode::CONFLICT,
            ApiResponse::err(
                format!(
                    "deployment {id} has {} dependent resources",
                    report.dependents.len()
                ),
                Some(DeleteOutcome::DependencyConflict(report)),
            ),
        )
            .into_response(),
        Ok(queued) => (StatusCode::ACCEPTED, ApiResponse::ok(queued)).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/v1/deployments/:id/logs
pub async fn deployment_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.service.deployment_logs(&id), StatusCode::OK)
}

// ── Projects ───────────────────────────────────────────────────

/// POST /api/v1/projects/:project/refresh
pub async fn refresh_project(
    State(state): State<ApiState>,
    Path(project): Path<String>,
) -> impl IntoResponse {
    respond(state.service.enqueue_refresh(&project), StatusCode::ACCEPTED)
}

/// GET /api/v1/projects/:project/quota
pub async fn get_quota(
    State(state): State<ApiState>,
    Path(project): Path<String>,
) -> impl IntoResponse {
    respond(state.service.get_quota(&project), StatusCode::OK)
}

/// Quota limits request body. Metrics left out become unconstrained.
#[derive(Debug, Deserialize)]
pub struct QuotaRequest {
    pub quotas: BTreeMap<String, u64>,
}

/// PUT /api/v1/projects/:project/quota
pub async fn set_quota(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    Json(req): Json<QuotaRequest>,
) -> impl IntoResponse {
    respond(state.service.set_quota(&project, req.quotas), StatusCode::OK)
}

/// POST /api/v1/projects/:project/providers
pub async fn register_provider(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    Json(req): Json<NewProvider>,
) -> impl IntoResponse {
    respond(state.service.register_provider(&project, req), StatusCode::CREATED)
}

// ── Templates ──────────────────────────────────────────────────

/// POST /api/v1/templates
pub async fn register_template(
    State(state): State<ApiState>,
    Json(template): Json<Template>,
) -> impl IntoResponse {
    respond(state.service.register_template(template), StatusCode::CREATED)
}

/// GET /api/v1/templates/:id
pub async fn get_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.service.template(&id), StatusCode::OK)
}
