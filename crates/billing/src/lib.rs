// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::SagaAborted boxes its source but still carries strings
#![allow(clippy::field_reassign_with_default)] // Used for conditional Stripe param setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subscription sync billing engine
//!
//! Keeps each customer's subscription record consistent with Stripe.
//!
//! ## Features
//!
//! - **Lifecycle**: Create, update at renewal, update immediately, cancel, recreate
//! - **Transaction coordinator**: Compare-and-set writes retried under one idempotency key
//! - **Recreate saga**: Named phases with re-run as the recovery path
//! - **Webhooks**: Verified invoice events reconciled by re-fetching from Stripe

pub mod catalog;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod saga;
pub mod store;
pub mod webhooks;

// Catalog
pub use catalog::{Benefit, CatalogStore, PgCatalogStore, Plan, Subscription};

// Client
pub use client::{StripeClient, StripeConfig};

// Coordinator
pub use coordinator::{RetryPolicy, TransactionCoordinator, TxContext, TxOutcome};

// Errors
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    BillingGateway, Correlation, GatewayError, GatewayResult, IdempotencyKey,
    NewRemoteSubscription, RemoteSubscription, RemoteSubscriptionItem, RemoteSubscriptionUpdate,
    StripeGateway,
};

// Lifecycle
pub use lifecycle::SubscriptionLifecycle;

// In-memory stores
pub use memory::{InMemoryCatalogStore, InMemoryUserSubscriptionStore};

// Model
pub use model::{
    PaymentConfirmation, PaymentIntentStatus, PaymentIntentSummary, SubscriptionStatus,
    UserSubscription,
};

// Saga
pub use saga::{RetireOutcome, SagaPhase};

// Store
pub use store::{PgUserSubscriptionStore, Precondition, UserSubscriptionStore, Versioned};

// Webhooks
pub use webhooks::{ReconcileOutcome, RenewalReconciler, WebhookEvent, WebhookVerifier};
