//! Per-customer subscription record and the transitions applied to it

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use subsync_shared::{CustomerId, PlanId, SubscriptionId, UserSubscriptionId};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::gateway::RemoteSubscription;

/// Mirrors the billing provider's subscription status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// The provider will never bill this subscription again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            other => Err(BillingError::Internal(format!(
                "unknown subscription status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
}

impl FromStr for PaymentIntentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requires_payment_method" => Ok(PaymentIntentStatus::RequiresPaymentMethod),
            "requires_confirmation" => Ok(PaymentIntentStatus::RequiresConfirmation),
            "requires_action" => Ok(PaymentIntentStatus::RequiresAction),
            "processing" => Ok(PaymentIntentStatus::Processing),
            "requires_capture" => Ok(PaymentIntentStatus::RequiresCapture),
            "canceled" => Ok(PaymentIntentStatus::Canceled),
            "succeeded" => Ok(PaymentIntentStatus::Succeeded),
            other => Err(BillingError::Internal(format!(
                "unknown payment intent status: {}",
                other
            ))),
        }
    }
}

/// Payment intent of a subscription's latest invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentSummary {
    pub id: String,
    pub status: PaymentIntentStatus,
    pub client_secret: Option<String>,
}

/// What a client needs to finish (or observe) the charge an operation produced.
///
/// Both fields are `None` when the latest invoice needed no payment (e.g. a zero total).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub status: Option<PaymentIntentStatus>,
    pub client_secret: Option<String>,
}

impl From<&RemoteSubscription> for PaymentConfirmation {
    fn from(remote: &RemoteSubscription) -> Self {
        match &remote.latest_payment_intent {
            Some(intent) => PaymentConfirmation {
                status: Some(intent.status),
                client_secret: intent.client_secret.clone(),
            },
            None => PaymentConfirmation {
                status: None,
                client_secret: None,
            },
        }
    }
}

/// A customer's subscription state, one per (customer, catalog subscription)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSubscription {
    pub id: UserSubscriptionId,
    pub customer_id: CustomerId,
    pub subscription_id: SubscriptionId,
    pub plan_id: PlanId,
    /// Plan queued to take over at the next renewal
    pub next_plan_id: Option<PlanId>,
    pub status: SubscriptionStatus,
    pub latest_payment_intent_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub stripe_subscription_id: String,
    pub stripe_subscription_item_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
}

/// Fields copied verbatim from the provider
struct RemoteFields {
    stripe_subscription_id: String,
    stripe_subscription_item_id: String,
    status: SubscriptionStatus,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    latest_payment_intent_id: Option<String>,
}

impl RemoteFields {
    fn read(remote: &RemoteSubscription) -> BillingResult<Self> {
        let item = remote.primary_item().ok_or_else(|| {
            BillingError::Internal(format!("subscription {} has no line items", remote.id))
        })?;

        Ok(Self {
            stripe_subscription_id: remote.id.clone(),
            stripe_subscription_item_id: item.id.clone(),
            status: remote.status,
            current_period_start: from_epoch(remote.current_period_start)?,
            current_period_end: from_epoch(remote.current_period_end)?,
            latest_payment_intent_id: remote.latest_payment_intent.as_ref().map(|i| i.id.clone()),
        })
    }
}

fn from_epoch(seconds: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|e| BillingError::Internal(format!("invalid period timestamp {}: {}", seconds, e)))
}

impl UserSubscription {
    /// Build the record for a freshly created remote subscription
    pub fn create(
        customer_id: CustomerId,
        subscription_id: SubscriptionId,
        plan_id: PlanId,
        remote: &RemoteSubscription,
        started_at: OffsetDateTime,
    ) -> BillingResult<Self> {
        let fields = RemoteFields::read(remote)?;
        Ok(Self {
            id: UserSubscriptionId::derive(&customer_id, &subscription_id),
            customer_id,
            subscription_id,
            plan_id,
            next_plan_id: None,
            status: fields.status,
            latest_payment_intent_id: fields.latest_payment_intent_id,
            started_at,
            stripe_subscription_id: fields.stripe_subscription_id,
            stripe_subscription_item_id: fields.stripe_subscription_item_id,
            current_period_start: fields.current_period_start,
            current_period_end: fields.current_period_end,
        })
    }

    /// Queue a plan change for the next renewal. Asking for the current plan drops
    /// whatever change was queued.
    pub fn queue_plan_change(&mut self, plan_id: PlanId) {
        self.next_plan_id = if plan_id == self.plan_id {
            None
        } else {
            Some(plan_id)
        };
    }

    /// Overwrite everything derived from the provider, switching to `plan_id` and
    /// dropping any queued change
    pub fn renew_all(&mut self, plan_id: PlanId, remote: &RemoteSubscription) -> BillingResult<()> {
        self.apply_remote(remote)?;
        self.plan_id = plan_id;
        self.next_plan_id = None;
        Ok(())
    }

    /// Copy status, period, references and latest payment intent from the provider
    pub fn apply_remote(&mut self, remote: &RemoteSubscription) -> BillingResult<()> {
        let fields = RemoteFields::read(remote)?;
        self.stripe_subscription_id = fields.stripe_subscription_id;
        self.stripe_subscription_item_id = fields.stripe_subscription_item_id;
        self.status = fields.status;
        self.current_period_start = fields.current_period_start;
        self.current_period_end = fields.current_period_end;
        self.latest_payment_intent_id = fields.latest_payment_intent_id;
        Ok(())
    }

    /// Whether the provider has moved on to a billing period later than the stored one
    pub fn has_rolled_over(&self, remote: &RemoteSubscription) -> BillingResult<bool> {
        Ok(from_epoch(remote.current_period_start)? > self.current_period_start)
    }

    /// Make the queued plan current. Returns the promoted plan, if any.
    pub fn promote_pending(&mut self) -> Option<PlanId> {
        let next = self.next_plan_id.take()?;
        self.plan_id = next.clone();
        Some(next)
    }
}
