//! Lease API handlers.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use super::ControllerState;
use crate::error::LeaseError;
use crate::lease::{AcquireRequest, Lease, LeaseList};

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

/// Body of `POST /leases/release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub underlay_ip: String,
}

/// Empty JSON object for endpoints with nothing to return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

/// Map a lease error onto a status code, prefixing the message with the
/// failing operation.
fn error_response(operation: &str, err: LeaseError) -> (StatusCode, Json<ApiError>) {
    let status = match &err {
        LeaseError::NonRetriable(_) => StatusCode::CONFLICT,
        LeaseError::Invalid(_) => StatusCode::BAD_REQUEST,
        LeaseError::NoLeaseAvailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match err {
        LeaseError::NonRetriable(message) => format!("{}: {}", operation, message),
        other => format!("{}: {}", operation, other),
    };
    if status.is_server_error() {
        error!("{}", message);
    }
    (status, Json(ApiError { error: message }))
}

pub async fn acquire(
    State(state): State<Arc<ControllerState>>,
    Json(req): Json<AcquireRequest>,
) -> ApiResult<Lease> {
    state
        .leaser
        .acquire(&req.underlay_ip, req.single_overlay_ip)
        .await
        .map(Json)
        .map_err(|e| error_response("acquire-subnet-lease", e))
}

pub async fn renew(
    State(state): State<Arc<ControllerState>>,
    Json(lease): Json<Lease>,
) -> ApiResult<Empty> {
    state
        .leaser
        .renew(&lease)
        .await
        .map(|()| Json(Empty {}))
        .map_err(|e| error_response("renew-subnet-lease", e))
}

pub async fn release(
    State(state): State<Arc<ControllerState>>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<Empty> {
    state
        .leaser
        .release(&req.underlay_ip)
        .await
        .map(|()| Json(Empty {}))
        .map_err(|e| error_response("release-subnet-lease", e))
}

pub async fn list(State(state): State<Arc<ControllerState>>) -> ApiResult<LeaseList> {
    state
        .leaser
        .list_active()
        .await
        .map(|leases| Json(LeaseList { leases }))
        .map_err(|e| error_response("list-subnet-leases", e))
}
