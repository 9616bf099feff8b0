//! Stripe implementation of the billing gateway

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
// Import the enums from the subscription modules explicitly; the crate root re-exports
// clash between `subscription` and `subscription_item`
use stripe::generated::billing::subscription::{
    SubscriptionBillingCycleAnchor, SubscriptionPaymentBehavior, SubscriptionProrationBehavior,
};
use stripe::generated::billing::subscription_item::{
    SubscriptionProrationBehavior as ItemProrationBehavior, UpdateSubscriptionItem,
};
use stripe::{
    CancelSubscription, CreateSubscription, CreateSubscriptionItems, ErrorCode, ErrorType,
    ListSubscriptions, PriceId, StripeError, Subscription, SubscriptionItem, SubscriptionItemId,
    SubscriptionStatus as StripeSubStatus, UpdateSubscription, UpdateSubscriptionItems,
};
use subsync_shared::CustomerId;

use super::{
    BillingGateway, Correlation, GatewayError, GatewayResult, IdempotencyKey,
    NewRemoteSubscription, RemoteSubscription, RemoteSubscriptionItem, RemoteSubscriptionUpdate,
    PLAN_ID_KEY,
};
use crate::client::StripeClient;
use crate::model::{PaymentIntentSummary, SubscriptionStatus};

/// Expansion that makes the latest invoice's payment intent available in responses
const EXPAND_PAYMENT_INTENT: &[&str] = &["latest_invoice.payment_intent"];

pub struct StripeGateway {
    stripe: StripeClient,
    timeout: Duration,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        let timeout = stripe.config().request_timeout;
        Self { stripe, timeout }
    }

    /// Bound a Stripe call by the configured timeout. A timed-out call is a failure with
    /// unknown outcome and is never reported as success.
    async fn call<T, F>(&self, request: F) -> GatewayResult<T>
    where
        F: Future<Output = Result<T, StripeError>> + Send,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(GatewayError::from),
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        }
    }
}

impl From<StripeError> for GatewayError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::Stripe(request) => {
                let message = request
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("HTTP {}", request.http_status));
                // Stripe also answers 409 for lock timeouts and other object conflicts;
                // only an idempotency error means the key was already used
                if request.code == Some(ErrorCode::IdempotencyKeyInUse)
                    || request.error_type == ErrorType::IdempotencyError
                {
                    GatewayError::IdempotentReplay
                } else if request.http_status == 404 {
                    GatewayError::NotFound(message)
                } else {
                    GatewayError::Rejected(message)
                }
            }
            other => GatewayError::Rejected(other.to_string()),
        }
    }
}

fn parse_subscription_id(id: &str) -> GatewayResult<stripe::SubscriptionId> {
    id.parse::<stripe::SubscriptionId>()
        .map_err(|e| GatewayError::Rejected(format!("Invalid subscription ID: {}", e)))
}

fn map_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
    }
}

fn to_remote(subscription: Subscription) -> GatewayResult<RemoteSubscription> {
    let latest_payment_intent = match subscription
        .latest_invoice
        .as_ref()
        .and_then(|invoice| invoice.as_object())
        .and_then(|invoice| invoice.payment_intent.as_ref())
        .and_then(|intent| intent.as_object())
    {
        Some(intent) => Some(PaymentIntentSummary {
            id: intent.id.to_string(),
            status: intent
                .status
                .as_str()
                .parse()
                .map_err(|e| GatewayError::Rejected(format!("{}", e)))?,
            client_secret: intent.client_secret.clone(),
        }),
        None => None,
    };

    Ok(RemoteSubscription {
        id: subscription.id.to_string(),
        customer_id: subscription.customer.id().to_string(),
        status: map_status(subscription.status),
        current_period_start: subscription.current_period_start,
        current_period_end: subscription.current_period_end,
        cancel_at_period_end: subscription.cancel_at_period_end,
        items: subscription
            .items
            .data
            .iter()
            .map(|item| RemoteSubscriptionItem {
                id: item.id.to_string(),
                price_id: item
                    .price
                    .as_ref()
                    .map(|p| p.id.to_string())
                    .unwrap_or_default(),
            })
            .collect(),
        metadata: subscription.metadata,
        latest_payment_intent,
    })
}

#[async_trait]
impl BillingGateway for StripeGateway {
    async fn create_subscription(
        &self,
        request: &NewRemoteSubscription,
        key: &IdempotencyKey,
    ) -> GatewayResult<RemoteSubscription> {
        let customer_id = request
            .customer_id
            .as_str()
            .parse::<stripe::CustomerId>()
            .map_err(|e| GatewayError::Rejected(format!("Invalid customer ID: {}", e)))?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        // Renew automatically; Stripe keeps billing until told otherwise
        params.cancel_at_period_end = Some(false);
        params.proration_behavior = Some(SubscriptionProrationBehavior::None);
        // Hand back an incomplete subscription instead of failing on the first charge
        params.payment_behavior = Some(SubscriptionPaymentBehavior::AllowIncomplete);
        params.metadata = Some(request.correlation.to_metadata());
        params.expand = EXPAND_PAYMENT_INTENT;

        let client = self.stripe.idempotent(key.as_str());
        let subscription = self.call(Subscription::create(&client, params)).await?;

        tracing::info!(
            customer_id = %request.customer_id,
            stripe_subscription_id = %subscription.id,
            "Created Stripe subscription"
        );

        to_remote(subscription)
    }

    async fn update_subscription_item(
        &self,
        item_id: &str,
        price_id: &str,
        key: &IdempotencyKey,
    ) -> GatewayResult<()> {
        let item_id = item_id
            .parse::<SubscriptionItemId>()
            .map_err(|e| GatewayError::Rejected(format!("Invalid subscription item ID: {}", e)))?;

        let params = item_price_update(price_id)?;

        let client = self.stripe.idempotent(key.as_str());
        self.call(SubscriptionItem::update(&client, &item_id, params))
            .await?;
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &RemoteSubscriptionUpdate,
        key: Option<&IdempotencyKey>,
    ) -> GatewayResult<RemoteSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription {
            expand: EXPAND_PAYMENT_INTENT,
            ..Default::default()
        };
        if let Some((item_id, price_id)) = &update.item_price {
            params.items = Some(vec![UpdateSubscriptionItems {
                id: Some(item_id.clone()),
                price: Some(price_id.clone()),
                ..Default::default()
            }]);
            params.proration_behavior = Some(SubscriptionProrationBehavior::None);
        }
        if let Some(plan_id) = &update.plan_id {
            params.metadata = Some(
                [(PLAN_ID_KEY.to_string(), plan_id.to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        if update.reset_billing_cycle {
            params.billing_cycle_anchor = Some(SubscriptionBillingCycleAnchor::Now);
            params.proration_behavior = Some(SubscriptionProrationBehavior::None);
        }
        params.cancel_at_period_end = update.cancel_at_period_end;
        if let Some(source) = update.default_source.as_deref() {
            params.default_source = Some(source.into());
        }

        let subscription = match key {
            Some(key) => {
                let client = self.stripe.idempotent(key.as_str());
                self.call(Subscription::update(&client, &sub_id, params))
                    .await?
            }
            None => {
                self.call(Subscription::update(self.stripe.inner(), &sub_id, params))
                    .await?
            }
        };

        to_remote(subscription)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> GatewayResult<RemoteSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        let subscription = self
            .call(Subscription::cancel(self.stripe.inner(), &sub_id, params))
            .await?;

        tracing::info!(
            stripe_subscription_id = %subscription.id,
            "Cancelled Stripe subscription"
        );

        to_remote(subscription)
    }

    async fn get_subscription(&self, subscription_id: &str) -> GatewayResult<RemoteSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let subscription = self
            .call(Subscription::retrieve(
                self.stripe.inner(),
                &sub_id,
                EXPAND_PAYMENT_INTENT,
            ))
            .await?;
        to_remote(subscription)
    }

    async fn find_subscription(
        &self,
        customer_id: &CustomerId,
        correlation: &Correlation,
    ) -> GatewayResult<Option<RemoteSubscription>> {
        let customer_id = customer_id
            .as_str()
            .parse::<stripe::CustomerId>()
            .map_err(|e| GatewayError::Rejected(format!("Invalid customer ID: {}", e)))?;

        let params = ListSubscriptions {
            customer: Some(customer_id),
            expand: &["data.latest_invoice.payment_intent"],
            ..Default::default()
        };

        let subscriptions = self
            .call(Subscription::list(self.stripe.inner(), &params))
            .await?;

        // Stripe lists newest first
        for subscription in subscriptions.data {
            let remote = to_remote(subscription)?;
            if !remote.status.is_terminal() && remote.correlation().as_ref() == Some(correlation) {
                return Ok(Some(remote));
            }
        }
        Ok(None)
    }
}

/// Swap an item's price without prorating; the new price bills from the next invoice
fn item_price_update(price_id: &str) -> GatewayResult<UpdateSubscriptionItem<'static>> {
    let price_id = price_id
        .parse::<PriceId>()
        .map_err(|e| GatewayError::Rejected(format!("Invalid price ID: {}", e)))?;

    Ok(UpdateSubscriptionItem {
        price: Some(price_id),
        proration_behavior: Some(ItemProrationBehavior::None),
        ..Default::default()
    })
}
