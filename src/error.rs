use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::models::OrderStatus;

/// Service-wide error taxonomy.
///
/// The split that matters is pre-capture versus post-capture: everything
/// before the gateway captures money is fully recoverable by retrying the
/// checkout from scratch, while `PersistenceError` after capture must carry
/// the `payment_id` so the user gets a traceable reference for support.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Payment signature verification failed")]
    SignatureMismatch,

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid order status transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Failed to record purchase state")]
    PersistenceError {
        /// Captured payment this failure relates to, when known. Always set
        /// on post-capture failures.
        payment_id: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        AppError::DatabaseError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
            /// Reference for manual reconciliation when money moved but the
            /// local record may be incomplete.
            #[serde(skip_serializing_if = "Option::is_none")]
            payment_id: Option<String>,
        }

        let (status, error_message, details, payment_id) = match self {
            AppError::ValidationError(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation error".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None, None),
            AppError::AuthError(msg) => (StatusCode::UNAUTHORIZED, msg, None, None),
            AppError::SignatureMismatch => (
                StatusCode::BAD_REQUEST,
                "Payment verification failed".to_string(),
                None,
                None,
            ),
            AppError::GatewayUnavailable(msg) => (
                StatusCode::BAD_GATEWAY,
                "Payment gateway unavailable".to_string(),
                Some(msg),
                None,
            ),
            AppError::InvalidAmount(msg) => (StatusCode::BAD_REQUEST, msg, None, None),
            AppError::InvalidTransition { from, to } => (
                StatusCode::CONFLICT,
                format!("Invalid order status transition: {} -> {}", from, to),
                None,
                None,
            ),
            AppError::PersistenceError { payment_id, source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to record purchase; please contact support with the payment reference"
                    .to_string(),
                Some(source.to_string()),
                payment_id,
            ),
            AppError::DatabaseError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::ConfigError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::InternalError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(err.to_string()),
                None,
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
                payment_id,
            }),
        )
            .into_response()
    }
}
