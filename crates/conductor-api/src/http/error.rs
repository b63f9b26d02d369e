//! HTTP error mapping.
//!
//! Core error kinds map onto status codes; response bodies are always
//! `{"error": "<short message>"}` with no internal details.

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use conductor_types::error::{CoreError, ErrorKind};
use serde_json::json;

/// API-level error carrying the mapped status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    retry_after: Option<u32>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// The information-hiding 404 for endpoints the caller may not see.
    pub fn endpoint_hidden(name: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("endpoint \"{name}\" not found"),
        )
    }

    pub fn with_retry_after(mut self, seconds: u32) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match e.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ErrorKind::InvalidInput | ErrorKind::ValidationFailed => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Draining | ErrorKind::CapacityExhausted | ErrorKind::Transient => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::NotCancellable | ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let api = Self::new(status, e.message().to_string());
        match e.kind() {
            ErrorKind::Draining | ErrorKind::CapacityExhausted => api.with_retry_after(10),
            _ => api,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status, Json(json!({"error": self.message}))).into_response();
        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from(seconds));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_to_status_mapping() {
        let cases = [
            (CoreError::not_found("x"), StatusCode::NOT_FOUND),
            (CoreError::validation("x"), StatusCode::BAD_REQUEST),
            (CoreError::unauthorized("x"), StatusCode::UNAUTHORIZED),
            (CoreError::rate_limited("x"), StatusCode::TOO_MANY_REQUESTS),
            (CoreError::draining("x"), StatusCode::SERVICE_UNAVAILABLE),
            (CoreError::not_cancellable("x"), StatusCode::CONFLICT),
            (CoreError::timeout("x"), StatusCode::REQUEST_TIMEOUT),
            (CoreError::fatal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status, status);
        }
    }

    #[test]
    fn test_draining_carries_retry_after() {
        let api = ApiError::from(CoreError::draining("drain"));
        assert_eq!(api.retry_after, Some(10));
    }

    #[test]
    fn test_endpoint_hidden_body_format() {
        let api = ApiError::endpoint_hidden("review-pr");
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert_eq!(api.message, "endpoint \"review-pr\" not found");
    }
}
