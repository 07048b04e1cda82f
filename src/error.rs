//! Error taxonomy shared by every control-plane component.
//!
//! Each variant maps to one HTTP status so handlers can simply return
//! `Result<Json<T>, ControlError>`.

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Malformed or oversized input. Never partially applied.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A transition precondition was not met; the caller must re-read state.
    #[error("state conflict on session {session_id}: expected {expected}, found {actual}")]
    StateConflict {
        session_id: String,
        expected: String,
        actual: SessionState,
    },

    /// Too many requests in the current window; retry after the given delay.
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("{0} not found")]
    NotFound(String),

    /// Store, bus or provisioner failure after internal retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl ControlError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::StateConflict { .. } => "state_conflict",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Unauthorized(_) => "unauthorized",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::StateConflict { .. } => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            Self::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };
        let body = ErrorResponse {
            error: ErrorBody {
                kind: self.kind(),
                message: self.to_string(),
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<crate::store::StoreError> for ControlError {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict {
                session_id,
                expected,
                actual,
            } => Self::StateConflict {
                session_id,
                expected,
                actual,
            },
            StoreError::Duplicate(what) => Self::Validation(what),
            other => Self::UpstreamUnavailable(other.to_string()),
        }
    }
}
