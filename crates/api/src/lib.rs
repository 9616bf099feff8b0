// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps billing messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subscription sync HTTP API
//!
//! Thin axum surface over the billing engine: one POST endpoint per lifecycle
//! operation, the Stripe webhook receiver and health checks.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
