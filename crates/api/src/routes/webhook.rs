//! Stripe webhook receiver

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// POST /webhook
///
/// Answers 200 for every verified delivery, including event types we ignore and
/// invoices with no matching record, so Stripe stops retrying them. Rejected
/// deliveries get a 4xx; provider or store failures get a 5xx and are retried.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::InvalidWebhook("Missing Stripe signature".to_string())
        })?;

    let outcome = state.reconciler.handle(&body, signature).await?;
    tracing::debug!(outcome = ?outcome, "Stripe webhook handled");

    Ok(StatusCode::OK)
}
