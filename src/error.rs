use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type QuotaResult<T> = Result<T, QuotaError>;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Quota exceeded for {namespace}:{bucket}")]
    QuotaExceeded { namespace: String, bucket: String },

    #[error("Backing store connection error: {0}")]
    Connection(String),

    #[error("Couldn't reach the backing store, even after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    #[error("Failed to apply configuration: {0}")]
    ConfigApply(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No such bucket {namespace}:{bucket}")]
    NoSuchBucket { namespace: String, bucket: String },

    #[error("No such namespace {0}")]
    NoSuchNamespace(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for QuotaError {
    fn from(err: redis::RedisError) -> Self {
        QuotaError::Connection(err.to_string())
    }
}

impl From<std::io::Error> for QuotaError {
    fn from(err: std::io::Error) -> Self {
        QuotaError::Persistence(err.to_string())
    }
}

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

    pub fn from_quota_error(err: &QuotaError) -> Self {
        let message = err.to_string();
        match err {
            QuotaError::QuotaExceeded { .. } => Self::new("quota_exceeded", &message, 429),
            QuotaError::Connection(_) | QuotaError::RetriesExhausted { .. } => {
                Self::new("service_unavailable", &message, 503)
            }
            QuotaError::ConfigApply(_) => Self::new("configuration_error", &message, 500),
            QuotaError::Validation(_) => Self::new("validation_error", &message, 422),
            QuotaError::NoSuchBucket { .. } | QuotaError::NoSuchNamespace(_) => {
                Self::new("not_found", &message, 404)
            }
            QuotaError::AlreadyExists(_) => Self::new("conflict", &message, 409),
            QuotaError::Persistence(_) => Self::new("persistence_error", &message, 500),
            QuotaError::Serialization(_) => Self::new("bad_request", &message, 400),
            QuotaError::Lifecycle(_) => Self::new("conflict", &message, 409),
            QuotaError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for QuotaError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_quota_error(&self);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let exhausted = ErrorResponse::from_quota_error(&QuotaError::RetriesExhausted { attempts: 3 });
        assert_eq!(exhausted.code, 503);
        assert!(exhausted.message.contains("3 attempts"));

        let missing = ErrorResponse::from_quota_error(&QuotaError::NoSuchBucket {
            namespace: "ns".to_string(),
            bucket: "b".to_string(),
        });
        assert_eq!(missing.code, 404);
        assert_eq!(missing.error, "not_found");

        let invalid = ErrorResponse::from_quota_error(&QuotaError::Validation("bad".into()));
        assert_eq!(invalid.code, 422);
    }

    #[test]
    fn test_redis_error_is_connection_error() {
        let err: QuotaError =
            redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into();
        assert!(matches!(err, QuotaError::Connection(_)));
    }
}
