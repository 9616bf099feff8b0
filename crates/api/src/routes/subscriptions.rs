//! Subscription lifecycle endpoints
//!
//! Each handler validates the raw identifiers, then hands off to
//! [`SubscriptionLifecycle`](subsync_billing::SubscriptionLifecycle).
//! Payment-bearing operations answer with the provider's confirmation
//! so the client can finish any pending authentication.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use subsync_billing::PaymentConfirmation;
use subsync_shared::{CustomerId, PlanId, SubscriptionId};

use crate::{error::ApiResult, state::AppState};

/// Body for operations that target a plan
#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub customer_id: String,
    pub subscription_id: String,
    pub plan_id: String,
}

impl PlanRequest {
    fn parse(self) -> ApiResult<(CustomerId, SubscriptionId, PlanId)> {
        Ok((
            CustomerId::new(self.customer_id)?,
            SubscriptionId::new(self.subscription_id)?,
            PlanId::new(self.plan_id)?,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub customer_id: String,
    pub subscription_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentMethodRequest {
    pub customer_id: String,
    pub subscription_id: String,
    pub source_id: String,
}

/// POST /create-subscription
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<PlanRequest>,
) -> ApiResult<Json<PaymentConfirmation>> {
    let (customer_id, subscription_id, plan_id) = req.parse()?;

    let confirmation = state
        .lifecycle
        .create(&customer_id, &subscription_id, &plan_id)
        .await?;

    Ok(Json(confirmation))
}

/// POST /update-subscription
///
/// Takes effect at the next renewal.
pub async fn update_subscription(
    State(state): State<AppState>,
    Json(req): Json<PlanRequest>,
) -> ApiResult<StatusCode> {
    let (customer_id, subscription_id, plan_id) = req.parse()?;

    state
        .lifecycle
        .update(&customer_id, &subscription_id, &plan_id)
        .await?;

    Ok(StatusCode::OK)
}

/// POST /update-subscription-immediately
pub async fn update_subscription_immediately(
    State(state): State<AppState>,
    Json(req): Json<PlanRequest>,
) -> ApiResult<Json<PaymentConfirmation>> {
    let (customer_id, subscription_id, plan_id) = req.parse()?;

    let confirmation = state
        .lifecycle
        .update_immediately(&customer_id, &subscription_id, &plan_id)
        .await?;

    Ok(Json(confirmation))
}

/// POST /cancel-subscription
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<StatusCode> {
    let customer_id = CustomerId::new(req.customer_id)?;
    let subscription_id = SubscriptionId::new(req.subscription_id)?;

    state.lifecycle.cancel(&customer_id, &subscription_id).await?;

    Ok(StatusCode::OK)
}

/// POST /recreate-subscription
pub async fn recreate_subscription(
    State(state): State<AppState>,
    Json(req): Json<PlanRequest>,
) -> ApiResult<Json<PaymentConfirmation>> {
    let (customer_id, subscription_id, plan_id) = req.parse()?;

    let confirmation = state
        .lifecycle
        .recreate(&customer_id, &subscription_id, &plan_id)
        .await?;

    Ok(Json(confirmation))
}

/// POST /update-subscription-payment
pub async fn update_subscription_payment(
    State(state): State<AppState>,
    Json(req): Json<PaymentMethodRequest>,
) -> ApiResult<StatusCode> {
    let customer_id = CustomerId::new(req.customer_id)?;
    let subscription_id = SubscriptionId::new(req.subscription_id)?;

    state
        .lifecycle
        .update_payment_method(&customer_id, &subscription_id, &req.source_id)
        .await?;

    Ok(StatusCode::OK)
}
