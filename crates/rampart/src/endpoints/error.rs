//! Error responses of the proxy surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use rampart_service::canonical::CanonicalizeError;
use rampart_service::proxying::OriginError;

/// An error response with a status code and a cause chain.
///
/// Cache subsystem errors never appear here: the cache is strictly
/// advisory, so only client mistakes (bad URL) and origin failures
/// surface.
#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<CanonicalizeError> for ResponseError {
    fn from(err: CanonicalizeError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            err: err.into(),
        }
    }
}

impl From<OriginError> for ResponseError {
    fn from(err: OriginError) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            err: err.into(),
        }
    }
}

impl From<axum::http::Error> for ResponseError {
    fn from(err: axum::http::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, error = ?self.err, "request failed");
        }
        (self.status, format!("{:#}", self.err)).into_response()
    }
}
