//! Subscription lifecycle operations
//!
//! Every operation runs through the [`TransactionCoordinator`]: provider mutations happen
//! first, and the local record is written only once they succeeded or were confirmed as
//! replays of an earlier attempt.

use std::sync::{Arc, OnceLock};

use subsync_shared::{CustomerId, PlanId, SubscriptionId, UserSubscriptionId};
use time::OffsetDateTime;

use crate::catalog::{CatalogStore, Plan};
use crate::coordinator::{recover_replay, TransactionCoordinator, TxOutcome};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    BillingGateway, Correlation, IdempotencyKey, NewRemoteSubscription, RemoteSubscription,
    RemoteSubscriptionUpdate,
};
use crate::model::{PaymentConfirmation, UserSubscription};
use crate::saga::{retire_remote, SagaPhase};

/// Subscription lifecycle service
pub struct SubscriptionLifecycle {
    catalog: Arc<dyn CatalogStore>,
    gateway: Arc<dyn BillingGateway>,
    coordinator: Arc<TransactionCoordinator>,
}

/// A catalog plan resolved for one customer
struct Target {
    id: UserSubscriptionId,
    plan: Plan,
    request: NewRemoteSubscription,
}

impl SubscriptionLifecycle {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        gateway: Arc<dyn BillingGateway>,
        coordinator: Arc<TransactionCoordinator>,
    ) -> Self {
        Self {
            catalog,
            gateway,
            coordinator,
        }
    }

    async fn resolve(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        plan_id: &PlanId,
    ) -> BillingResult<Target> {
        let subscription = self.catalog.require_subscription(subscription_id).await?;
        let plan = subscription.require_plan(plan_id)?.clone();

        Ok(Target {
            id: subscription.user_subscription_id(customer_id),
            request: NewRemoteSubscription {
                customer_id: customer_id.clone(),
                price_id: plan.stripe_price_id.clone(),
                correlation: Correlation::new(subscription_id.clone(), plan_id.clone()),
            },
            plan,
        })
    }

    /// Subscribe a customer to a plan. Fails with `AlreadyExists` if the customer already
    /// has a record for this catalog subscription. If a concurrent create commits first,
    /// the subscription this call created is cancelled before `AlreadyExists` is returned.
    pub async fn create(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        plan_id: &PlanId,
    ) -> BillingResult<PaymentConfirmation> {
        let target = self.resolve(customer_id, subscription_id, plan_id).await?;
        let gateway = self.gateway.as_ref();
        let target = &target;
        let created = &OnceLock::new();

        let result = self
            .coordinator
            .run("create", &target.id, move |ctx| async move {
                // On a retry this means another create committed first
                if ctx.record.is_some() {
                    return Err(BillingError::AlreadyExists(target.id.to_string()));
                }

                let remote = create_remote(gateway, &target.request, &ctx.key).await?;
                created.get_or_init(|| remote.id.clone());
                let record = UserSubscription::create(
                    target.request.customer_id.clone(),
                    target.request.correlation.subscription_id.clone(),
                    target.plan.id.clone(),
                    &remote,
                    OffsetDateTime::now_utc(),
                )?;

                Ok(TxOutcome::write(record, PaymentConfirmation::from(&remote)))
            })
            .await;
        let confirmation = discard_unrecorded(gateway, "create", created, result).await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            plan_id = %plan_id,
            "Created subscription"
        );

        Ok(confirmation)
    }

    /// Switch plans at the next renewal. The current plan stays in force until the
    /// renewal event promotes the queued one.
    pub async fn update(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        plan_id: &PlanId,
    ) -> BillingResult<()> {
        let target = self.resolve(customer_id, subscription_id, plan_id).await?;
        let gateway = self.gateway.as_ref();
        let target = &target;

        self.coordinator
            .run("update", &target.id, move |ctx| async move {
                let mut record = require_record(&target.id, ctx.record)?;

                // Both provider steps must land before the local write
                let item = gateway
                    .update_subscription_item(
                        &record.stripe_subscription_item_id,
                        &target.plan.stripe_price_id,
                        &ctx.key.derive("item"),
                    )
                    .await;
                recover_replay("update", item, || async { Ok::<_, BillingError>(()) }).await?;

                let metadata = gateway
                    .update_subscription(
                        &record.stripe_subscription_id,
                        &RemoteSubscriptionUpdate {
                            plan_id: Some(target.plan.id.clone()),
                            ..Default::default()
                        },
                        Some(&ctx.key.derive("metadata")),
                    )
                    .await
                    .map(|_| ());
                recover_replay("update", metadata, || async { Ok::<_, BillingError>(()) }).await?;

                record.queue_plan_change(target.plan.id.clone());
                Ok(TxOutcome::write(record, ()))
            })
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            plan_id = %plan_id,
            "Queued plan change for next renewal"
        );

        Ok(())
    }

    /// Switch plans now, restarting the billing cycle and invoicing the new plan
    pub async fn update_immediately(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        plan_id: &PlanId,
    ) -> BillingResult<PaymentConfirmation> {
        let target = self.resolve(customer_id, subscription_id, plan_id).await?;
        let gateway = self.gateway.as_ref();
        let target = &target;

        let confirmation = self
            .coordinator
            .run("update_immediately", &target.id, move |ctx| async move {
                let mut record = require_record(&target.id, ctx.record)?;
                let stripe_subscription_id = record.stripe_subscription_id.clone();

                let update = RemoteSubscriptionUpdate {
                    item_price: Some((
                        record.stripe_subscription_item_id.clone(),
                        target.plan.stripe_price_id.clone(),
                    )),
                    plan_id: Some(target.plan.id.clone()),
                    reset_billing_cycle: true,
                    cancel_at_period_end: Some(false),
                    default_source: None,
                };
                let result = gateway
                    .update_subscription(&stripe_subscription_id, &update, Some(&ctx.key))
                    .await;
                let remote = recover_replay("update_immediately", result, || async {
                    gateway
                        .get_subscription(&stripe_subscription_id)
                        .await
                        .map_err(BillingError::from)
                })
                .await?;

                record.renew_all(target.plan.id.clone(), &remote)?;
                Ok(TxOutcome::write(record, PaymentConfirmation::from(&remote)))
            })
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            plan_id = %plan_id,
            "Switched plan immediately"
        );

        Ok(confirmation)
    }

    /// Stop renewing at the end of the current period. The local record is left alone;
    /// the final renewal event records the terminal status.
    pub async fn cancel(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
    ) -> BillingResult<()> {
        let id = UserSubscriptionId::derive(customer_id, subscription_id);
        let gateway = self.gateway.as_ref();
        let id_ref = &id;

        self.coordinator
            .run("cancel", &id, move |ctx| async move {
                let record = require_record(id_ref, ctx.record)?;
                let result = gateway
                    .update_subscription(
                        &record.stripe_subscription_id,
                        &RemoteSubscriptionUpdate {
                            cancel_at_period_end: Some(true),
                            ..Default::default()
                        },
                        Some(&ctx.key),
                    )
                    .await
                    .map(|_| ());
                recover_replay("cancel", result, || async { Ok::<_, BillingError>(()) }).await?;
                Ok(TxOutcome::read_only(()))
            })
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            "Subscription set to cancel at period end"
        );

        Ok(())
    }

    /// Replace the customer's remote subscription with a fresh one on `plan_id`, keeping
    /// the same local record. See [`crate::saga`].
    pub async fn recreate(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        plan_id: &PlanId,
    ) -> BillingResult<PaymentConfirmation> {
        let target = self.resolve(customer_id, subscription_id, plan_id).await?;
        let gateway = self.gateway.as_ref();
        let target = &target;
        let created = &OnceLock::new();

        let result = self
            .coordinator
            .run("recreate", &target.id, move |ctx| async move {
                let mut record = require_record(&target.id, ctx.record)?;

                let retired = retire_remote(gateway, &record.stripe_subscription_id)
                    .await
                    .map_err(|e| SagaPhase::RetirePrevious.abort(e))?;
                tracing::debug!(
                    stripe_subscription_id = %record.stripe_subscription_id,
                    outcome = ?retired,
                    "Retired previous subscription"
                );

                let remote = create_remote(gateway, &target.request, &ctx.key)
                    .await
                    .map_err(|e| SagaPhase::CreateReplacement.abort(e))?;
                created.get_or_init(|| remote.id.clone());

                record
                    .renew_all(target.plan.id.clone(), &remote)
                    .map_err(|e| SagaPhase::CommitLocal.abort(e))?;
                Ok(TxOutcome::write(record, PaymentConfirmation::from(&remote)))
            })
            .await;
        let confirmation = discard_unrecorded(gateway, "recreate", created, result)
            .await
            .map_err(|e| match e {
                BillingError::ConcurrentModification(_) | BillingError::Database(_) => {
                    SagaPhase::CommitLocal.abort(e)
                }
                other => other,
            })?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            plan_id = %plan_id,
            "Recreated subscription"
        );

        Ok(confirmation)
    }

    /// Charge future invoices to a different payment source
    pub async fn update_payment_method(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        source_id: &str,
    ) -> BillingResult<()> {
        if source_id.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "source_id must not be empty".to_string(),
            ));
        }

        let id = UserSubscriptionId::derive(customer_id, subscription_id);
        let gateway = self.gateway.as_ref();
        let id_ref = &id;

        self.coordinator
            .run("update_payment", &id, move |ctx| async move {
                let record = require_record(id_ref, ctx.record)?;
                let result = gateway
                    .update_subscription(
                        &record.stripe_subscription_id,
                        &RemoteSubscriptionUpdate {
                            default_source: Some(source_id.to_string()),
                            ..Default::default()
                        },
                        Some(&ctx.key),
                    )
                    .await
                    .map(|_| ());
                recover_replay("update_payment", result, || async { Ok::<_, BillingError>(()) })
                    .await?;
                Ok(TxOutcome::read_only(()))
            })
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            "Updated subscription payment method"
        );

        Ok(())
    }
}

fn require_record(
    id: &UserSubscriptionId,
    record: Option<UserSubscription>,
) -> BillingResult<UserSubscription> {
    record.ok_or_else(|| BillingError::UserSubscriptionNotFound(id.to_string()))
}

/// Create the remote subscription; on a replayed key find the one the earlier attempt
/// created through its correlation metadata
/// Cancel the provider subscription an operation created once the operation has failed
/// without recording it. A database error leaves the commit's outcome unknown, so the
/// subscription is kept for the reconciler.
async fn discard_unrecorded<T>(
    gateway: &dyn BillingGateway,
    operation: &str,
    created: &OnceLock<String>,
    result: BillingResult<T>,
) -> BillingResult<T> {
    let Some(orphan) = created.get() else {
        return result;
    };
    if matches!(&result, Ok(_) | Err(BillingError::Database(_))) {
        return result;
    }

    match retire_remote(gateway, orphan).await {
        Ok(outcome) => tracing::warn!(
            operation,
            stripe_subscription_id = %orphan,
            outcome = ?outcome,
            "Cancelled unrecorded subscription"
        ),
        Err(e) => tracing::error!(
            operation,
            stripe_subscription_id = %orphan,
            error = %e,
            "Failed to cancel unrecorded subscription"
        ),
    }
    result
}

async fn create_remote(
    gateway: &dyn BillingGateway,
    request: &NewRemoteSubscription,
    key: &IdempotencyKey,
) -> BillingResult<RemoteSubscription> {
    let result = gateway.create_subscription(request, key).await;
    recover_replay("create", result, || async {
        match gateway
            .find_subscription(&request.customer_id, &request.correlation)
            .await
        {
            Ok(Some(remote)) => Ok(remote),
            Ok(None) => Err(BillingError::GatewayRejected(format!(
                "idempotent replay for key {} but no matching subscription exists",
                key
            ))),
            Err(e) => Err(e.into()),
        }
    })
    .await
}
