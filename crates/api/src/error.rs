//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subsync_billing::BillingError;
use subsync_shared::InvalidId;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Invalid webhook: {0}")]
    InvalidWebhook(String),
    #[error("Payload too large")]
    PayloadTooLarge,

    // Resource errors
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Resource already exists: {0}")]
    Conflict(String),

    // Internal errors
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Validation
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::InvalidWebhook(msg) => (StatusCode::BAD_REQUEST, "INVALID_WEBHOOK", msg.clone()),
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", self.to_string()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Internal
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::SubscriptionNotFound(_)
            | BillingError::PlanNotFound { .. }
            | BillingError::InvalidInput(_) => ApiError::BadRequest(err.to_string()),
            BillingError::UserSubscriptionNotFound(_) => ApiError::NotFound(err.to_string()),
            BillingError::AlreadyExists(_) => ApiError::Conflict(err.to_string()),
            BillingError::WebhookPayloadTooLarge { .. } => ApiError::PayloadTooLarge,
            BillingError::WebhookSignatureInvalid | BillingError::WebhookPayloadInvalid(_) => {
                tracing::warn!(error = %err, "Rejected Stripe webhook");
                ApiError::InvalidWebhook(err.to_string())
            }
            // Provider, store and saga failures carry internal detail; log it, return nothing
            other => {
                tracing::error!(error = %other, "Request failed");
                ApiError::Internal
            }
        }
    }
}

impl From<InvalidId> for ApiError {
    fn from(err: InvalidId) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
