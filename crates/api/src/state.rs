//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use subsync_billing::{
    BillingGateway, CatalogStore, PgCatalogStore, PgUserSubscriptionStore, RenewalReconciler,
    RetryPolicy, StripeClient, StripeGateway, SubscriptionLifecycle, TransactionCoordinator,
    UserSubscriptionStore, WebhookVerifier,
};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<SubscriptionLifecycle>,
    pub reconciler: Arc<RenewalReconciler>,
    /// Checked by the health endpoint
    pub store: Arc<dyn UserSubscriptionStore>,
}

impl AppState {
    /// Wire the engine from its seams
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        store: Arc<dyn UserSubscriptionStore>,
        gateway: Arc<dyn BillingGateway>,
        verifier: WebhookVerifier,
        policy: RetryPolicy,
    ) -> Self {
        let coordinator = Arc::new(TransactionCoordinator::new(store.clone(), policy));
        let lifecycle = SubscriptionLifecycle::new(catalog, gateway.clone(), coordinator.clone());
        let reconciler = RenewalReconciler::new(verifier, gateway, coordinator);

        Self {
            lifecycle: Arc::new(lifecycle),
            reconciler: Arc::new(reconciler),
            store,
        }
    }

    /// Production wiring: Postgres stores and the Stripe gateway
    pub fn from_config(config: &Config, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config.stripe_config());
        let verifier = WebhookVerifier::new(config.stripe_webhook_secret.clone())
            .with_tolerance(config.webhook_tolerance_secs)
            .with_max_body_bytes(config.webhook_max_body_bytes);

        Self::new(
            Arc::new(PgCatalogStore::new(pool.clone())),
            Arc::new(PgUserSubscriptionStore::new(pool)),
            Arc::new(StripeGateway::new(stripe)),
            verifier,
            config.retry_policy(),
        )
    }

    pub fn webhook_max_body_bytes(&self) -> usize {
        self.reconciler.verifier().max_body_bytes()
    }
}
