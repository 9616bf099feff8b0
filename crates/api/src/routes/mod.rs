//! API routes

pub mod health;
pub mod subscriptions;
pub mod webhook;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    let subscription_routes = Router::new()
        .route("/create-subscription", post(subscriptions::create_subscription))
        .route("/update-subscription", post(subscriptions::update_subscription))
        .route(
            "/update-subscription-immediately",
            post(subscriptions::update_subscription_immediately),
        )
        .route("/cancel-subscription", post(subscriptions::cancel_subscription))
        .route("/recreate-subscription", post(subscriptions::recreate_subscription))
        .route(
            "/update-subscription-payment",
            post(subscriptions::update_subscription_payment),
        );

    // Oversized deliveries are refused before the body is buffered
    let webhook_routes = Router::new().route(
        "/webhook",
        post(webhook::webhook).layer(DefaultBodyLimit::max(state.webhook_max_body_bytes())),
    );

    Router::new()
        .merge(health_routes)
        .merge(subscription_routes)
        .merge(webhook_routes)
        .with_state(state)
}
