//! Billing provider gateway
//!
//! The narrow mutation surface the engine needs from the provider, plus the plain data
//! types the rest of the crate works with instead of provider SDK types.

mod stripe_gateway;

pub use stripe_gateway::StripeGateway;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use subsync_shared::{CustomerId, PlanId, SubscriptionId};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{PaymentIntentSummary, SubscriptionStatus};

/// Metadata key carrying the catalog subscription id
pub const SUBSCRIPTION_ID_KEY: &str = "subscription_id";
/// Metadata key carrying the plan id
pub const PLAN_ID_KEY: &str = "plan_id";

/// Token giving a provider mutation effect-once semantics.
///
/// One key is minted per operation invocation and reused for every local retry of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn generate(scope: &str) -> Self {
        Self(format!("{}-{}", scope, Uuid::new_v4()))
    }

    /// Key for one provider call within a multi-call operation
    pub fn derive(&self, step: &str) -> Self {
        Self(format!("{}-{}", self.0, step))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The link between a remote subscription and the catalog, stored as remote metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub subscription_id: SubscriptionId,
    pub plan_id: PlanId,
}

impl Correlation {
    pub fn new(subscription_id: SubscriptionId, plan_id: PlanId) -> Self {
        Self {
            subscription_id,
            plan_id,
        }
    }

    pub fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                SUBSCRIPTION_ID_KEY.to_string(),
                self.subscription_id.to_string(),
            ),
            (PLAN_ID_KEY.to_string(), self.plan_id.to_string()),
        ])
    }

    /// Read the correlation back; `None` if either key is missing or invalid
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Option<Self> {
        let subscription_id = SubscriptionId::new(metadata.get(SUBSCRIPTION_ID_KEY)?.as_str()).ok()?;
        let plan_id = PlanId::new(metadata.get(PLAN_ID_KEY)?.as_str()).ok()?;
        Some(Self::new(subscription_id, plan_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscriptionItem {
    pub id: String,
    pub price_id: String,
}

/// Provider-side subscription as last observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    /// Epoch seconds
    pub current_period_start: i64,
    /// Epoch seconds
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    pub items: Vec<RemoteSubscriptionItem>,
    pub metadata: HashMap<String, String>,
    pub latest_payment_intent: Option<PaymentIntentSummary>,
}

impl RemoteSubscription {
    /// The single line item every engine-created subscription carries
    pub fn primary_item(&self) -> Option<&RemoteSubscriptionItem> {
        self.items.first()
    }

    pub fn correlation(&self) -> Option<Correlation> {
        Correlation::from_metadata(&self.metadata)
    }
}

/// Parameters for creating a remote subscription
#[derive(Debug, Clone)]
pub struct NewRemoteSubscription {
    pub customer_id: CustomerId,
    pub price_id: String,
    pub correlation: Correlation,
}

/// Fields to change on a remote subscription; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSubscriptionUpdate {
    /// Swap the price of an existing line item: (item id, price id)
    pub item_price: Option<(String, String)>,
    /// New `plan_id` correlation metadata
    pub plan_id: Option<PlanId>,
    /// Restart the billing cycle now, producing an immediate invoice
    pub reset_billing_cycle: bool,
    pub cancel_at_period_end: Option<bool>,
    pub default_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The provider reports the idempotency key as already used; the original request's
    /// outcome is unknown to this caller
    #[error("Idempotency key already used")]
    IdempotentReplay,

    #[error("Not found on billing provider: {0}")]
    NotFound(String),

    #[error("Billing provider rejected the request: {0}")]
    Rejected(String),

    #[error("Billing provider call timed out after {0:?}")]
    Timeout(Duration),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Provider operations consumed by the engine. Mutations take the operation's
/// idempotency key.
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Create a subscription with one item (quantity 1), auto-renewing, without
    /// proration, allowing an incomplete first payment
    async fn create_subscription(
        &self,
        request: &NewRemoteSubscription,
        key: &IdempotencyKey,
    ) -> GatewayResult<RemoteSubscription>;

    /// Change the price of a line item without proration
    async fn update_subscription_item(
        &self,
        item_id: &str,
        price_id: &str,
        key: &IdempotencyKey,
    ) -> GatewayResult<()>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &RemoteSubscriptionUpdate,
        key: Option<&IdempotencyKey>,
    ) -> GatewayResult<RemoteSubscription>;

    /// Cancel immediately
    async fn cancel_subscription(&self, subscription_id: &str) -> GatewayResult<RemoteSubscription>;

    async fn get_subscription(&self, subscription_id: &str) -> GatewayResult<RemoteSubscription>;

    /// Find a customer's live subscription carrying the given correlation
    async fn find_subscription(
        &self,
        customer_id: &CustomerId,
        correlation: &Correlation,
    ) -> GatewayResult<Option<RemoteSubscription>>;
}
