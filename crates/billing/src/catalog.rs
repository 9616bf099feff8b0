//! Subscription catalog
//!
//! Read-only view of the sellable subscriptions and their plans. Entries are written by
//! the provisioning tool (which also creates the matching Stripe products and prices) and
//! are immutable once published.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use subsync_shared::{CustomerId, PlanId, SubscriptionId, UserSubscriptionId};

use crate::error::{BillingError, BillingResult};

/// Perk attached to a plan (discounts and the like); carried but not interpreted here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Benefit {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub title: String,
    pub stripe_product_id: String,
    pub stripe_price_id: String,
    /// Price in the smallest currency unit
    pub price: i64,
    #[serde(default)]
    pub benefits: Vec<Benefit>,
}

/// A catalog subscription holding an ordered list of plans
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub title: String,
    pub plans: Vec<Plan>,
}

impl Subscription {
    pub fn plan(&self, plan_id: &PlanId) -> Option<&Plan> {
        self.plans.iter().find(|plan| &plan.id == plan_id)
    }

    /// Resolve a plan or fail with a catalog miss
    pub fn require_plan(&self, plan_id: &PlanId) -> BillingResult<&Plan> {
        self.plan(plan_id).ok_or_else(|| BillingError::PlanNotFound {
            subscription_id: self.id.to_string(),
            plan_id: plan_id.to_string(),
        })
    }

    pub fn user_subscription_id(&self, customer_id: &CustomerId) -> UserSubscriptionId {
        UserSubscriptionId::derive(customer_id, &self.id)
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_subscription(&self, id: &SubscriptionId) -> BillingResult<Option<Subscription>>;

    /// Resolve a subscription or fail with a catalog miss
    async fn require_subscription(&self, id: &SubscriptionId) -> BillingResult<Subscription> {
        self.get_subscription(id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }
}

/// Catalog backed by the `catalog_subscriptions` table
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn get_subscription(&self, id: &SubscriptionId) -> BillingResult<Option<Subscription>> {
        let row: Option<(String, sqlx::types::Json<Vec<Plan>>)> =
            sqlx::query_as("SELECT title, plans FROM catalog_subscriptions WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(title, plans)| Subscription {
            id: id.clone(),
            title,
            plans: plans.0,
        }))
    }
}
