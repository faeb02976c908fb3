// =============================================================================
// ERROR MODULE
// =============================================================================
// Error taxonomy for the service and its mapping onto HTTP responses.
//
// - Validation and business-rule failures are raised close to the boundary
//   and become structured 4xx JSON bodies.
// - Gateway failures surface as 502/504.
// - Anything unexpected becomes a generic 500; details stay in the logs.
//
// Webhook notifications that must not be retried (unknown order, amount
// mismatch) are not errors at all: the reconciler answers them with an
// "ignored" acknowledgement instead.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ErrorResponse;

#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    // -------------------------------------------------------------------------
    // CLIENT ERRORS
    // -------------------------------------------------------------------------
    /// Missing or malformed input
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Missing or invalid bearer token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Gateway notification signature did not match
    #[error("Invalid notification signature")]
    InvalidSignature,

    /// Order absent or not owned by the caller
    #[error("Not found: {0}")]
    NotFound(String),

    /// Order is already settled or otherwise not eligible
    #[error("Conflict: {0}")]
    Conflict(String),

    // -------------------------------------------------------------------------
    // BUSINESS RULES
    // -------------------------------------------------------------------------
    #[error("Insufficient stock for product {product_id} size {size}: available {available}, requested {requested}")]
    InsufficientStock {
        product_id: Uuid,
        size: String,
        available: i32,
        requested: i32,
    },

    /// Client-submitted total does not match the server-side total
    #[error("Price mismatch: submitted {submitted}, computed {computed}")]
    PriceMismatch {
        submitted: Decimal,
        computed: Decimal,
    },

    /// Store is in maintenance mode
    #[error("Store unavailable: {0}")]
    Maintenance(String),

    // -------------------------------------------------------------------------
    // PAYMENT GATEWAY
    // -------------------------------------------------------------------------
    /// Non-2xx or unreadable response from the payment gateway
    #[error("Payment gateway error: {0}")]
    UpstreamGateway(String),

    /// Payment gateway did not answer in time
    #[error("Payment gateway timed out: {0}")]
    GatewayTimeout(String),

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Classification used by the client to pick a user-facing message.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Validation(_)
            | AppError::InsufficientStock { .. }
            | AppError::PriceMismatch { .. }
            | AppError::Conflict(_)
            | AppError::NotFound(_)
            | AppError::Unauthorized(_)
            | AppError::InvalidSignature => "validation",
            AppError::UpstreamGateway(_) => "network",
            AppError::GatewayTimeout(_) => "timeout",
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::Maintenance(_)
            | AppError::Internal(_) => "system",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::PriceMismatch { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) | AppError::InvalidSignature => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::InsufficientStock { .. } => StatusCode::CONFLICT,
            AppError::Maintenance(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let (error_code, message, details) = match &self {
            AppError::Validation(msg) => ("VALIDATION_ERROR", msg.clone(), None),
            AppError::Unauthorized(msg) => ("UNAUTHORIZED", msg.clone(), None),
            AppError::InvalidSignature => (
                "INVALID_SIGNATURE",
                "Notification signature verification failed".to_string(),
                None,
            ),
            AppError::NotFound(msg) => ("NOT_FOUND", msg.clone(), None),
            AppError::Conflict(msg) => ("CONFLICT", msg.clone(), None),
            AppError::InsufficientStock {
                product_id,
                size,
                available,
                requested,
            } => (
                "INSUFFICIENT_STOCK",
                format!("Available: {}, Requested: {}", available, requested),
                Some(serde_json::json!({
                    "product_id": product_id,
                    "size": size,
                    "available": available,
                    "requested": requested,
                })),
            ),
            AppError::PriceMismatch {
                submitted,
                computed,
            } => (
                "PRICE_MISMATCH",
                "Order total does not match current prices".to_string(),
                Some(serde_json::json!({
                    "submitted": submitted,
                    "computed": computed,
                })),
            ),
            AppError::Maintenance(msg) => ("MAINTENANCE", msg.clone(), None),
            AppError::UpstreamGateway(msg) => ("GATEWAY_ERROR", msg.clone(), None),
            AppError::GatewayTimeout(msg) => ("GATEWAY_TIMEOUT", msg.clone(), None),

            // Internal details never leave the service
            AppError::Database(_) => (
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            AppError::Redis(_) => ("CACHE_ERROR", "A cache error occurred".to_string(), None),
            AppError::Internal(_) => (
                "INTERNAL_ERROR",
                "An unexpected error occurred".to_string(),
                None,
            ),
        };

        if status.is_server_error() {
            tracing::error!(
                error_code = error_code,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::warn!(
                error_code = error_code,
                message = %message,
                "Request rejected"
            );
        }

        let mut body = ErrorResponse::new(error_code, message, self.error_type());
        if let Some(details) = details {
            body = body.with_details(details);
        }

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::GatewayTimeout(err.to_string())
        } else {
            AppError::UpstreamGateway(err.to_string())
        }
    }
}
