//! HTTP transport (spec §4.L), mirroring `freeq-auth-broker`'s and
//! `freeq-server`'s `Router::new().route(...)` + `State<Arc<...>>` style.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::breakglass::{BreakGlassEvent, BreakGlassStore, ReasonCode};
use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::requests::{RequestStatus, RequestStore};

use super::types::{
    CreateBreakGlassRequest, ErrorResponse, IssueCredentialRequest, IssueCredentialResponse,
    UpdateApprovalRequest,
};

/// The orchestrator plus the two stores the approval/break-glass
/// management endpoints operate on directly — thin CRUD wrappers over D/E
/// that sit alongside, not inside, the orchestrator's own `issue()` path
/// (spec §4.L: "approval-management and break-glass-management endpoints
/// are thin CRUD wrappers over D/E").
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub request_store: Arc<dyn RequestStore>,
    pub breakglass_store: Arc<dyn BreakGlassStore>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/credentials", post(issue_credential))
        .route("/v1/approvals/{id}", get(get_approval).post(update_approval))
        .route("/v1/break-glass", post(create_break_glass))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Extracts the caller's principal ARN, proven by the transport (e.g. a
/// signed request from a trusted authenticator). The concrete
/// authentication mechanism is external to the core per spec §1's
/// Non-goals; this reads a header the authenticator is trusted to set.
fn extract_principal_arn(headers: &HeaderMap) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    headers
        .get("x-sentinel-principal-arn")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    code: "ValidationError".into(),
                    message: "missing authenticated principal".into(),
                }),
            )
        })
}

async fn issue_credential(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IssueCredentialRequest>,
) -> Result<Json<IssueCredentialResponse>, (StatusCode, Json<ErrorResponse>)> {
    let principal_arn = extract_principal_arn(&headers)?;
    let request = body.into_domain(principal_arn).map_err(|msg| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                code: "ValidationError".into(),
                message: msg,
            }),
        )
    })?;

    match state.orchestrator.issue(request).await {
        Ok(outcome) => Ok(Json(outcome.into())),
        Err(e) => Err(map_error(e)),
    }
}

async fn get_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::requests::ApprovalRequest>, (StatusCode, Json<ErrorResponse>)> {
    state
        .request_store
        .get(&id)
        .await
        .map(Json)
        .map_err(|e| map_error(e.into()))
}

async fn update_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateApprovalRequest>,
) -> Result<Json<crate::requests::ApprovalRequest>, (StatusCode, Json<ErrorResponse>)> {
    let target = parse_request_status(&body.status).map_err(|msg| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                code: "ValidationError".into(),
                message: msg,
            }),
        )
    })?;
    state
        .request_store
        .update_status(&id, target, &body.by, body.expected_version)
        .await
        .map(Json)
        .map_err(|e| map_error(e.into()))
}

async fn create_break_glass(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBreakGlassRequest>,
) -> Result<Json<BreakGlassEvent>, (StatusCode, Json<ErrorResponse>)> {
    let reason_code = parse_reason_code(&body.reason_code).map_err(|msg| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                code: "ValidationError".into(),
                message: msg,
            }),
        )
    })?;
    let event = BreakGlassEvent::new(
        body.invoker,
        body.profile,
        reason_code,
        body.justification,
        chrono::Duration::seconds(body.ttl_secs),
    )
    .map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                code: "ValidationError".into(),
                message: e.to_string(),
            }),
        )
    })?;
    state
        .breakglass_store
        .create(event)
        .await
        .map(Json)
        .map_err(|e| map_error(e.into()))
}

fn parse_request_status(s: &str) -> Result<RequestStatus, String> {
    match s {
        "approved" => Ok(RequestStatus::Approved),
        "denied" => Ok(RequestStatus::Denied),
        "cancelled" => Ok(RequestStatus::Cancelled),
        other => Err(format!("unknown status: {other}")),
    }
}

fn parse_reason_code(s: &str) -> Result<ReasonCode, String> {
    match s {
        "incident" => Ok(ReasonCode::Incident),
        "maintenance" => Ok(ReasonCode::Maintenance),
        "security" => Ok(ReasonCode::Security),
        "recovery" => Ok(ReasonCode::Recovery),
        "other" => Ok(ReasonCode::Other),
        other => Err(format!("unknown reason code: {other}")),
    }
}

fn map_error(e: OrchestratorError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::PolicyDenied { .. } => StatusCode::FORBIDDEN,
        OrchestratorError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
        OrchestratorError::AlreadyActive => StatusCode::CONFLICT,
        OrchestratorError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
        OrchestratorError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let code = e.code().to_string();
    (status, Json(ErrorResponse { code, message: e.to_string() }))
}
