//! User-subscription persistence with optimistic concurrency

use async_trait::async_trait;
use sqlx::PgPool;
use subsync_shared::{CustomerId, PlanId, SubscriptionId, UserSubscriptionId};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::model::{SubscriptionStatus, UserSubscription};

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Condition a commit must meet; otherwise it fails with `LocalConflict`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No record may exist at the id yet
    Absent,
    /// The stored record must still be at this version
    Version(u64),
}

#[async_trait]
pub trait UserSubscriptionStore: Send + Sync {
    async fn get(&self, id: &UserSubscriptionId) -> BillingResult<Option<Versioned<UserSubscription>>>;

    /// Write the record if the precondition holds, returning the new version
    async fn commit(&self, record: &UserSubscription, precondition: Precondition) -> BillingResult<u64>;

    async fn health_check(&self) -> BillingResult<()>;
}

/// Store backed by the `user_subscriptions` table
pub struct PgUserSubscriptionStore {
    pool: PgPool,
}

impl PgUserSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct UserSubscriptionRow {
    id: String,
    customer_id: String,
    subscription_id: String,
    plan_id: String,
    next_plan_id: Option<String>,
    status: String,
    latest_payment_intent_id: Option<String>,
    started_at: OffsetDateTime,
    stripe_subscription_id: String,
    stripe_subscription_item_id: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    version: i64,
}

impl TryFrom<UserSubscriptionRow> for Versioned<UserSubscription> {
    type Error = BillingError;

    fn try_from(row: UserSubscriptionRow) -> BillingResult<Self> {
        let status: SubscriptionStatus = row.status.parse()?;
        Ok(Versioned {
            value: UserSubscription {
                id: UserSubscriptionId::from_stored(row.id),
                customer_id: CustomerId::new(row.customer_id)?,
                subscription_id: SubscriptionId::new(row.subscription_id)?,
                plan_id: PlanId::new(row.plan_id)?,
                next_plan_id: row.next_plan_id.map(PlanId::new).transpose()?,
                status,
                latest_payment_intent_id: row.latest_payment_intent_id,
                started_at: row.started_at,
                stripe_subscription_id: row.stripe_subscription_id,
                stripe_subscription_item_id: row.stripe_subscription_item_id,
                current_period_start: row.current_period_start,
                current_period_end: row.current_period_end,
            },
            version: row.version as u64,
        })
    }
}

#[async_trait]
impl UserSubscriptionStore for PgUserSubscriptionStore {
    async fn get(&self, id: &UserSubscriptionId) -> BillingResult<Option<Versioned<UserSubscription>>> {
        let row: Option<UserSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, customer_id, subscription_id, plan_id, next_plan_id, status,
                   latest_payment_intent_id, started_at, stripe_subscription_id,
                   stripe_subscription_item_id, current_period_start, current_period_end, version
            FROM user_subscriptions
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Versioned::try_from).transpose()
    }

    async fn commit(&self, record: &UserSubscription, precondition: Precondition) -> BillingResult<u64> {
        let result = match precondition {
            Precondition::Absent => {
                sqlx::query(
                    r#"
                    INSERT INTO user_subscriptions (
                        id, customer_id, subscription_id, plan_id, next_plan_id, status,
                        latest_payment_intent_id, started_at, stripe_subscription_id,
                        stripe_subscription_item_id, current_period_start, current_period_end,
                        version, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 1, NOW())
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(record.id.as_str())
                .bind(record.customer_id.as_str())
                .bind(record.subscription_id.as_str())
                .bind(record.plan_id.as_str())
                .bind(record.next_plan_id.as_ref().map(|p| p.as_str()))
                .bind(record.status.as_str())
                .bind(record.latest_payment_intent_id.as_deref())
                .bind(record.started_at)
                .bind(&record.stripe_subscription_id)
                .bind(&record.stripe_subscription_item_id)
                .bind(record.current_period_start)
                .bind(record.current_period_end)
                .execute(&self.pool)
                .await?
            }
            Precondition::Version(expected) => {
                sqlx::query(
                    r#"
                    UPDATE user_subscriptions
                    SET plan_id = $2,
                        next_plan_id = $3,
                        status = $4,
                        latest_payment_intent_id = $5,
                        stripe_subscription_id = $6,
                        stripe_subscription_item_id = $7,
                        current_period_start = $8,
                        current_period_end = $9,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $1 AND version = $10
                    "#,
                )
                .bind(record.id.as_str())
                .bind(record.plan_id.as_str())
                .bind(record.next_plan_id.as_ref().map(|p| p.as_str()))
                .bind(record.status.as_str())
                .bind(record.latest_payment_intent_id.as_deref())
                .bind(&record.stripe_subscription_id)
                .bind(&record.stripe_subscription_item_id)
                .bind(record.current_period_start)
                .bind(record.current_period_end)
                .bind(expected as i64)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(BillingError::LocalConflict(format!(
                "user subscription {} changed since it was read",
                record.id
            )));
        }

        Ok(match precondition {
            Precondition::Absent => 1,
            Precondition::Version(expected) => expected + 1,
        })
    }

    async fn health_check(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
