//! Error-to-HTTP response conversion.
//!
//! Route handlers return `Result<T, AppError>`; [`AppError`] renders any
//! [`rh_core::Error`] as a JSON `{error, code}` body with the matching
//! status. Answers that tell the client to come back later (`503`) carry a
//! `Retry-After` header, and `416` carries `Content-Range: bytes */size`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Seconds a client is asked to wait before retrying a `503`.
pub const RETRY_AFTER_SECS: u64 = 2;

/// Wrapper so we can implement `IntoResponse` for an external type.
#[derive(Debug)]
pub struct AppError {
    inner: rh_core::Error,
}

impl AppError {
    pub fn new(inner: rh_core::Error) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &rh_core::Error {
        &self.inner
    }

    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match &self.inner {
            rh_core::Error::NotFound { .. } => "not_found",
            rh_core::Error::NotReady(_) => "not_ready",
            rh_core::Error::Protocol(_) => "bad_request",
            rh_core::Error::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            rh_core::Error::Validation(_) => "validation_error",
            rh_core::Error::StoreBusy(_) => "busy",
            rh_core::Error::StoreCorrupt(_) | rh_core::Error::StoreRecovering => "recovering",
            rh_core::Error::Database { .. } => "database_error",
            rh_core::Error::Io { .. } => "io_error",
            rh_core::Error::Tool { .. } => "tool_error",
            rh_core::Error::Extraction(_) => "extraction_error",
            rh_core::Error::Timeout(_) => "timeout",
            rh_core::Error::Internal(_) => "internal_error",
        }
    }
}

impl From<rh_core::Error> for AppError {
    fn from(e: rh_core::Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
        }

        let body = json!({
            "error": self.inner.to_string(),
            "code": self.code(),
        });

        let mut response = (status, axum::Json(body)).into_response();
        let headers = response.headers_mut();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        if let rh_core::Error::RangeNotSatisfiable { size } = self.inner {
            if let Ok(v) = HeaderValue::from_str(&format!("bytes */{size}")) {
                headers.insert(header::CONTENT_RANGE, v);
            }
        }
        response
    }
}
