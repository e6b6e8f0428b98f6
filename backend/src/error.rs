//! Error handling for the Farm Operations Platform
//!
//! Every service returns [`AppResult`]; errors are mapped to a JSON body once,
//! at the axum boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use shared::{BlockStatus, LifecycleError, QueryValidationError};
use thiserror::Error;

use crate::services::query_engine::QueryExecutionError;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Authentication errors
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    // Validation errors
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    // Lifecycle errors
    #[error("Invalid transition from {current} to {requested}")]
    InvalidTransition {
        current: BlockStatus,
        requested: BlockStatus,
        allowed: Vec<BlockStatus>,
    },

    // AI query errors
    #[error("Query rejected: {0}")]
    QueryValidation(#[from] QueryValidationError),

    #[error("Query failed: {0}")]
    QueryExecution(QueryExecutionError),

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Internal errors
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::InvalidTransition {
                current,
                requested,
                allowed,
            } => AppError::InvalidTransition {
                current,
                requested,
                allowed,
            },
            LifecycleError::Validation { field, message } => AppError::Validation { field, message },
        }
    }
}

impl From<QueryExecutionError> for AppError {
    fn from(err: QueryExecutionError) -> Self {
        match err {
            QueryExecutionError::Validation(inner) => AppError::QueryValidation(inner),
            other => AppError::QueryExecution(other),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let (field, message) = errors
            .field_errors()
            .into_iter()
            .next()
            .map(|(field, errs)| {
                let message = errs
                    .first()
                    .and_then(|e| e.message.as_ref().map(|m| m.to_string()))
                    .unwrap_or_else(|| format!("{} is invalid", field));
                (field.to_string(), message)
            })
            .unwrap_or_else(|| ("input".to_string(), "Invalid input".to_string()));
        AppError::Validation { field, message }
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorDetail {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            field: None,
            details: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_detail) = match &self {
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorDetail::new("UNAUTHORIZED", msg.clone()),
            ),
            AppError::InsufficientPermissions => (
                StatusCode::FORBIDDEN,
                ErrorDetail::new(
                    "INSUFFICIENT_PERMISSIONS",
                    "You do not have permission to perform this action",
                ),
            ),
            AppError::Validation { field, message } => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    field: Some(field.clone()),
                    ..ErrorDetail::new("VALIDATION_ERROR", message.clone())
                },
            ),
            AppError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                ErrorDetail::new("NOT_FOUND", format!("{} not found", resource)),
            ),
            AppError::InvalidTransition {
                current,
                requested,
                allowed,
            } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorDetail {
                    details: Some(serde_json::json!({
                        "current": current,
                        "requested": requested,
                        "allowed": allowed,
                    })),
                    ..ErrorDetail::new(
                        "INVALID_TRANSITION",
                        format!("Cannot move block from {} to {}", current, requested),
                    )
                },
            ),
            AppError::QueryValidation(err) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    details: Some(serde_json::json!({
                        "operator": err.operator,
                        "stage": err.stage,
                    })),
                    ..ErrorDetail::new("QUERY_REJECTED", err.reason.clone())
                },
            ),
            AppError::QueryExecution(err) => (
                StatusCode::BAD_GATEWAY,
                ErrorDetail {
                    details: Some(serde_json::json!({ "kind": err.kind() })),
                    ..ErrorDetail::new("QUERY_EXECUTION_ERROR", err.to_string())
                },
            ),
            AppError::DatabaseError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("DATABASE_ERROR", "A database error occurred"),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("INTERNAL_ERROR", msg.clone()),
            ),
        };

        if status.is_server_error() {
            tracing::error!("Error: {:?}", self);
        } else {
            tracing::debug!("Request failed: {}", self);
        }

        (status, Json(ErrorResponse { error: error_detail })).into_response()
    }
}

/// Result type alias for handlers
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::NotFound("Block".into()), StatusCode::NOT_FOUND),
            (
                AppError::InvalidTransition {
                    current: BlockStatus::Empty,
                    requested: BlockStatus::Harvesting,
                    allowed: vec![BlockStatus::Planted, BlockStatus::Alert],
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (AppError::validation("quantity_kg", "must be positive"), StatusCode::BAD_REQUEST),
            (
                AppError::QueryValidation(QueryValidationError::new("nope")),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::QueryExecution(QueryExecutionError::Generation("timeout".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (AppError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_lifecycle_error_conversion() {
        let err: AppError = LifecycleError::validation("target_crop", "required").into();
        match err {
            AppError::Validation { field, .. } => assert_eq!(field, "target_crop"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_validation_kind_of_execution_error_is_a_rejection() {
        let err: AppError =
            QueryExecutionError::Validation(QueryValidationError::new("bad").with_operator("$where")).into();
        assert!(matches!(err, AppError::QueryValidation(_)));
    }
}
