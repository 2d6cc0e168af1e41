use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the isolation subsystem.
///
/// Delivery failures are never represented here: they are recorded in the
/// manager's recovery queue and metrics instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IsolationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("User {user_id} reached the manager limit ({current}/{max})")]
    ResourceLimit {
        user_id: String,
        current: usize,
        max: usize,
    },

    #[error(
        "Isolation violation: connection owned by {connection_user} cannot attach to manager owned by {manager_user}"
    )]
    IsolationViolation {
        manager_user: String,
        connection_user: String,
    },

    #[error("Manager for user {0} is no longer active")]
    InactiveManager(String),

    #[error("Manager factory has been shut down")]
    FactoryShutDown,

    #[error("No shared manager factory has been installed")]
    FactoryNotInstalled,
}

impl IsolationError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether this error signals a cross-user access attempt
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::IsolationViolation { .. })
    }
}

pub type IsolationResult<T> = std::result::Result<T, IsolationError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = match &self {
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Internal(e) => {
                let log_msg = e.clone();
                let client_msg = if is_production() {
                    "Internal server error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", client_msg, log_msg)
            }
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
