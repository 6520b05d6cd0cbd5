use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the dispatch core to its callers.
///
/// Adapter failures are not part of this enum: they are retried or recorded
/// as job outcomes (see [`crate::adapter::AdapterError`]) and never cross the
/// router boundary as errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unknown idempotency key: {0}")]
    UnknownKey(String),

    #[error("Idempotency store error: {0}")]
    Store(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_dispatch_error(err: &DispatchError) -> Self {
        let message = err.to_string();
        match err {
            DispatchError::QueueFull { .. } => Self::new("queue_full", &message, 503),
            DispatchError::ValidationError(_) => Self::new("validation_error", &message, 422),
            DispatchError::UnknownKey(_) => Self::new("not_found", &message, 404),
            DispatchError::Store(_) | DispatchError::Redis(_) => {
                Self::new("service_unavailable", &message, 503)
            }
            DispatchError::Serialization(_) => Self::new("bad_request", &message, 400),
            DispatchError::ConfigurationError(_) => {
                Self::new("configuration_error", &message, 500)
            }
            DispatchError::ShuttingDown => Self::new("shutting_down", &message, 503),
            DispatchError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_dispatch_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut response = (status, Json(body)).into_response();
        if matches!(self, DispatchError::QueueFull { .. }) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_maps_to_service_unavailable() {
        let response = DispatchError::QueueFull { capacity: 1 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn test_error_response_codes() {
        let validation = ErrorResponse::from_dispatch_error(&DispatchError::ValidationError(
            "summary is empty".into(),
        ));
        assert_eq!(validation.code, 422);
        assert_eq!(validation.error, "validation_error");

        let missing =
            ErrorResponse::from_dispatch_error(&DispatchError::UnknownKey("idem:abc".into()));
        assert_eq!(missing.code, 404);
    }
}
