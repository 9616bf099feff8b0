//! Billing error types

use subsync_shared::InvalidId;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::saga::SagaPhase;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Subscription not found in catalog: {0}")]
    SubscriptionNotFound(String),

    #[error("Plan {plan_id} not found in subscription {subscription_id}")]
    PlanNotFound {
        subscription_id: String,
        plan_id: String,
    },

    #[error("User subscription not found: {0}")]
    UserSubscriptionNotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Billing provider rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Local write conflict: {0}")]
    LocalConflict(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload is malformed: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Webhook payload of {size} bytes exceeds the {limit} byte limit")]
    WebhookPayloadTooLarge { size: usize, limit: usize },

    #[error("Recreate aborted during {phase}: {source}")]
    SagaAborted {
        phase: SagaPhase,
        #[source]
        source: Box<BillingError>,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors the caller caused; nothing was mutated on either side
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            BillingError::SubscriptionNotFound(_)
                | BillingError::PlanNotFound { .. }
                | BillingError::InvalidInput(_)
        )
    }

    /// Webhook deliveries that should be rejected without a redelivery-worthy status
    pub fn is_webhook_rejection(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSignatureInvalid
                | BillingError::WebhookPayloadInvalid(_)
                | BillingError::WebhookPayloadTooLarge { .. }
        )
    }

    pub(crate) fn is_local_conflict(&self) -> bool {
        matches!(self, BillingError::LocalConflict(_))
    }
}

impl From<GatewayError> for BillingError {
    fn from(err: GatewayError) -> Self {
        BillingError::GatewayRejected(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<InvalidId> for BillingError {
    fn from(err: InvalidId) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
