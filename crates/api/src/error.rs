//! Gateway error taxonomy and its mapping onto HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use domain::DomainError;
use raft::ConsensusError;
use thiserror::Error;

/// Everything a gateway handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed body or missing required input. Never reaches Apply.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The state machine rejected the command.
    #[error(transparent)]
    Domain(DomainError),

    /// A local read found nothing under the requested id.
    #[error("{0}")]
    NotFound(String),

    /// Write attempted on a follower. Carries the leader's address so
    /// the client can retry there.
    #[error("not the leader")]
    NotLeader { leader_addr: Option<String> },

    /// The command did not commit within the deadline; outcome unknown.
    #[error("apply timed out; the command may still commit")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            // An update aimed at a missing entity is a 404; every other
            // rejection is the client's 400.
            ApiError::Domain(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Domain(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ConsensusError> for ApiError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NotLeader { leader_addr, .. } => ApiError::NotLeader { leader_addr },
            ConsensusError::Timeout(_) => ApiError::Timeout,
            ConsensusError::Shutdown => ApiError::Internal("node is shutting down".into()),
            ConsensusError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::NotLeader { leader_addr } => serde_json::json!({
                "error": self.to_string(),
                "leader": leader_addr,
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
