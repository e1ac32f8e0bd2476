//! Admin-edge error mapping and shared response helpers

use crate::allowlist::AllowlistError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Helper to create a plain response - infallible with valid StatusCode
pub fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Errors surfaced by admin API handlers
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad input at the edge; no state change happened
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Allowlist(#[from] AllowlistError),

    /// The gateway refused or could not be reached
    #[error("gateway request failed: {0}")]
    Gateway(anyhow::Error),

    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Allowlist(AllowlistError::AlreadyAssigned { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Allowlist(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// One-line plain-text rendition; no stack traces reach clients
    pub fn into_response(self) -> Response<Full<Bytes>> {
        response(self.status_code(), self.to_string())
    }
}
