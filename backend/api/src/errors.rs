//! Application-wide error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cleargive_protocol::Error as RuleError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Rule(RuleError::Validation(msg.into()))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::Rule(RuleError::NotFound(msg.into()))
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Rule(RuleError::Unauthenticated(msg.into()))
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Rule(RuleError::Conflict(msg.into()))
    }

    /// Stable kind reported in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rule(e) => e.kind(),
            Self::Database(_) | Self::Migrate(_) | Self::Config(_) => "persistence_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Rule(RuleError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Rule(RuleError::Unauthenticated(_)) => StatusCode::UNAUTHORIZED,
            Self::Rule(RuleError::Forbidden(_)) => StatusCode::FORBIDDEN,
            Self::Rule(RuleError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Rule(RuleError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Database(_) | Self::Migrate(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Map a unique-constraint violation to Conflict; pass anything else through.
pub fn conflict_on_unique(err: sqlx::Error, msg: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::conflict(msg),
        _ => AppError::Database(err),
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Rule(e) => e.to_string(),
            other => {
                error!(error = %other, "request failed on the store");
                "A persistence error occurred".to_string()
            }
        };
        (
            status,
            Json(ErrorResponse {
                status: "error",
                error: self.kind(),
                message,
            }),
        )
            .into_response()
    }
}
