//! Shared error type for the collaboration core.
//!
//! Every fallible operation in this crate returns [`CoreError`]. Handlers at
//! the edges (the WebSocket dispatcher, the HTTP health surface) translate it
//! into the representation their transport expects — a ShareDB error frame or
//! an HTTP status.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("operation invalid: {0}")]
    OperationInvalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Database(_) | CoreError::Internal(_) => "SERVER_ERROR",
            CoreError::Validation(_) | CoreError::OperationInvalid(_) => "OPERATION_INVALID",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::PolicyViolation(_) => "POLICY_VIOLATION",
        }
    }

    /// Render as a `{code, message}` pair suitable for a ShareDB error frame.
    pub fn as_wire(&self) -> (String, String) {
        (self.code().to_string(), self.to_string())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Database(e.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            CoreError::Database(_) | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Validation(_) | CoreError::OperationInvalid(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::PolicyViolation(_) => StatusCode::FORBIDDEN,
        };
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_map_correctly() {
        assert_eq!(
            CoreError::OperationInvalid("x".into()).code(),
            "OPERATION_INVALID"
        );
        assert_eq!(CoreError::Database("x".into()).code(), "SERVER_ERROR");
        assert_eq!(
            CoreError::PolicyViolation("x".into()).code(),
            "POLICY_VIOLATION"
        );
    }
}
