//! Integration tests for the subscription lifecycle
//!
//! Every flow runs against the in-memory stores and a scripted Stripe stand-in, so no
//! network or database is needed.
//!
//! ## Running Tests
//! ```bash
//! cargo test -p subsync-billing --test integration
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;
