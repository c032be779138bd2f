//! Service layer errors.

use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid permission format: {0}")]
    InvalidPermissionFormat(String),

    #[error("Cycle detected: {0}")]
    Cycle(String),

    #[error("Service scope violation: {0}")]
    ServiceScopeViolation(String),

    #[error("Immutable field: {0}")]
    Immutable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Cancelled")]
    Cancelled,
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => {
                AppError::DatabaseError(anyhow::anyhow!("Database error: {}", e))
            }
            ServiceError::Redis(e) => AppError::CacheError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::InvalidPermissionFormat(msg) => {
                AppError::BadRequest(anyhow::anyhow!("Invalid permission format: {}", msg))
            }
            ServiceError::Cycle(msg) => AppError::Conflict(anyhow::anyhow!("Cycle detected: {}", msg)),
            ServiceError::ServiceScopeViolation(msg) => {
                AppError::PermissionDenied(anyhow::anyhow!(msg))
            }
            ServiceError::Immutable(msg) => {
                AppError::Conflict(anyhow::anyhow!("Immutable field: {}", msg))
            }
            ServiceError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            ServiceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ServiceError::VersionConflict { expected, actual } => AppError::Conflict(
                anyhow::anyhow!("Version conflict: expected {}, found {}", expected, actual),
            ),
            ServiceError::InvalidCredentials => {
                AppError::Unauthenticated(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::InvalidToken(msg) => {
                AppError::Unauthenticated(anyhow::anyhow!("Invalid token: {}", msg))
            }
            ServiceError::TokenExpired => {
                AppError::Unauthenticated(anyhow::anyhow!("Token expired"))
            }
            ServiceError::TokenRevoked => {
                AppError::Unauthenticated(anyhow::anyhow!("Token revoked"))
            }
            ServiceError::PermissionDenied(msg) => AppError::PermissionDenied(anyhow::anyhow!(msg)),
            ServiceError::DeadlineExceeded => {
                AppError::ServiceUnavailable("Deadline exceeded".to_string())
            }
            ServiceError::Cancelled => AppError::ServiceUnavailable("Request cancelled".to_string()),
        }
    }
}
