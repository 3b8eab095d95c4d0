//! REST API handlers for rollouts and releases.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{info, warn};

use canary_controller::ControllerError;
use canary_state::RolloutRequest;

use crate::ApiState;

/// Response wrapper for every API endpoint.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn api_error(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a controller error onto an HTTP status.
fn controller_error(err: ControllerError) -> Response {
    let status = match &err {
        ControllerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ControllerError::UnknownService(_) => StatusCode::NOT_FOUND,
        ControllerError::RolloutInProgress { .. }
        | ControllerError::NoActiveRollout(_)
        | ControllerError::InvalidPhase { .. }
        | ControllerError::ResolveInProgress(_) => StatusCode::CONFLICT,
        ControllerError::Degraded { .. } => StatusCode::LOCKED,
        ControllerError::Router(_) | ControllerError::Operation(_) => StatusCode::BAD_GATEWAY,
        ControllerError::Interrupted(_) | ControllerError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    api_error(&err.to_string(), status)
}

/// Body of a `202 Accepted` rollout submission.
#[derive(Debug, Serialize)]
pub struct Accepted {
    pub rollout_id: String,
    pub service: String,
}

/// POST /api/v1/rollouts
pub async fn submit_rollout(
    State(state): State<ApiState>,
    Json(req): Json<RolloutRequest>,
) -> Response {
    let service = req.service_name.clone();
    match state.controller.submit(req) {
        Ok(rollout_id) => {
            info!(service = %service, rollout = %rollout_id, "rollout submitted via API");
            (
                StatusCode::ACCEPTED,
                ApiResponse::ok(Accepted {
                    rollout_id,
                    service,
                }),
            )
                .into_response()
        }
        Err(e) => controller_error(e),
    }
}

/// GET /api/v1/releases
pub async fn list_releases(State(state): State<ApiState>) -> Response {
    match state.controller.releases() {
        Ok(releases) => ApiResponse::ok(releases).into_response(),
        Err(e) => controller_error(e),
    }
}

/// GET /api/v1/releases/{service}
pub async fn get_release(State(state): State<ApiState>, Path(service): Path<String>) -> Response {
    match state.controller.release(&service) {
        Ok(release) => ApiResponse::ok(release).into_response(),
        Err(e) => controller_error(e),
    }
}

/// GET /api/v1/releases/{service}/history
pub async fn release_history(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> Response {
    if !state.controller.config().is_known(&service) {
        return controller_error(ControllerError::UnknownService(service));
    }
    match state.controller.history(&service) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => controller_error(e),
    }
}

/// GET /api/v1/releases/{service}/groups
pub async fn release_groups(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> Response {
    match state.controller.groups(&service).await {
        Ok(groups) => ApiResponse::ok(groups).into_response(),
        Err(e) => controller_error(e),
    }
}

/// POST /api/v1/releases/{service}/promote
pub async fn promote(State(state): State<ApiState>, Path(service): Path<String>) -> Response {
    match state.controller.promote(&service) {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok("promote requested")).into_response(),
        Err(e) => controller_error(e),
    }
}

/// POST /api/v1/releases/{service}/rollback
pub async fn rollback(State(state): State<ApiState>, Path(service): Path<String>) -> Response {
    match state.controller.rollback(&service) {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok("rollback requested")).into_response(),
        Err(e) => controller_error(e),
    }
}

/// POST /api/v1/releases/{service}/resolve
pub async fn resolve(State(state): State<ApiState>, Path(service): Path<String>) -> Response {
    match state.controller.resolve(&service).await {
        Ok(release) => ApiResponse::ok(release).into_response(),
        Err(e) => controller_error(e),
    }
}

/// GET /api/v1/routes
pub async fn list_routes(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.controller.routes().await).into_response()
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
