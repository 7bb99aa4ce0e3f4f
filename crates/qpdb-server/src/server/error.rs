//! Mapping of query failures onto HTTP responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use qpdb::QpdbError;
use tracing::error;

/// Failure of a query request. Rendered as a plain-text body.
#[derive(Debug)]
pub enum ApiError {
    Query(QpdbError),
    Worker(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Query(QpdbError::InvalidIdentity | QpdbError::UnsafePath(_)) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<QpdbError> for ApiError {
    fn from(e: QpdbError) -> Self {
        ApiError::Query(e)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Query(e) => write!(f, "{}", e),
            ApiError::Worker(msg) => write!(f, "query worker failed: {}", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        error!("{} {}", status.as_u16(), message);
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            message,
        )
            .into_response()
    }
}
