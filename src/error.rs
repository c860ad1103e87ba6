//! Crate-wide error taxonomy for the federation subsystem.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Structural errors that can propagate out of the peer-federation service
/// and its HTTP surface. Upstream/storage failures during a sync cycle are
/// absorbed into a `SyncResult` instead of becoming one of these — see
/// `federation_service::PeerFederationService::sync_peer`.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("upstream peer error (transient): {0}")]
    TransientUpstream(String),

    #[error("upstream peer error (permanent): {0}")]
    PermanentUpstream(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl FederationError {
    fn status_code(&self) -> StatusCode {
        match self {
            FederationError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FederationError::NotFound(_) => StatusCode::NOT_FOUND,
            FederationError::AlreadyExists(_) => StatusCode::CONFLICT,
            FederationError::InvalidState(_) => StatusCode::BAD_REQUEST,
            FederationError::Unauthenticated => StatusCode::UNAUTHORIZED,
            FederationError::Unauthorized(_) => StatusCode::FORBIDDEN,
            FederationError::TransientUpstream(_) => StatusCode::BAD_GATEWAY,
            FederationError::PermanentUpstream(_) => StatusCode::BAD_GATEWAY,
            FederationError::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FederationError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            FederationError::InvalidInput(_) => "invalid_input",
            FederationError::NotFound(_) => "not_found",
            FederationError::AlreadyExists(_) => "already_exists",
            FederationError::InvalidState(_) => "invalid_state",
            FederationError::Unauthenticated => "unauthenticated",
            FederationError::Unauthorized(_) => "unauthorized",
            FederationError::TransientUpstream(_) => "transient_upstream",
            FederationError::PermanentUpstream(_) => "permanent_upstream",
            FederationError::StorageFailure(_) => "storage_failure",
            FederationError::InternalError(_) => "internal_error",
        }
    }
}

impl IntoResponse for FederationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type FederationResult<T> = Result<T, FederationError>;
