//! Transaction coordinator
//!
//! Runs a unit of work against one user-subscription record: read the versioned record,
//! perform at most one logical provider mutation, then compare-and-set the result. A lost
//! compare-and-set re-runs the whole unit against a fresh read. The operation's
//! idempotency key is minted once, before the first attempt, so a re-run hits the
//! provider with the same key and cannot apply the mutation twice.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use subsync_shared::UserSubscriptionId;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayError, GatewayResult, IdempotencyKey};
use crate::model::UserSubscription;
use crate::store::{Precondition, UserSubscriptionStore};

/// Backoff applied between attempts after a lost compare-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        // 2x, 4x, 8x ... the base delay, capped
        ExponentialBackoff::from_millis(2)
            .factor(self.base_delay.as_millis().max(1) as u64)
            .max_delay(self.max_delay)
            .take(self.max_retries)
            .map(jitter)
    }
}

/// What a unit of work sees on each attempt
#[derive(Debug, Clone)]
pub struct TxContext {
    /// The record as of this attempt, `None` if it does not exist yet
    pub record: Option<UserSubscription>,
    /// Operation-scoped key, identical on every attempt
    pub key: IdempotencyKey,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Result of one attempt: an optional record to commit plus the caller's value
#[derive(Debug)]
pub struct TxOutcome<T> {
    pub write: Option<UserSubscription>,
    pub value: T,
}

impl<T> TxOutcome<T> {
    pub fn write(record: UserSubscription, value: T) -> Self {
        Self {
            write: Some(record),
            value,
        }
    }

    pub fn read_only(value: T) -> Self {
        Self { write: None, value }
    }
}

pub struct TransactionCoordinator {
    store: Arc<dyn UserSubscriptionStore>,
    policy: RetryPolicy,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn UserSubscriptionStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn UserSubscriptionStore> {
        &self.store
    }

    /// Run `work` against the record at `id` until it commits, fails for a reason
    /// other than a local conflict, or runs out of retries
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        id: &UserSubscriptionId,
        work: F,
    ) -> BillingResult<T>
    where
        F: Fn(TxContext) -> Fut + Sync,
        Fut: Future<Output = BillingResult<TxOutcome<T>>> + Send,
        T: Send,
    {
        let key = IdempotencyKey::generate(operation);
        let attempts = AtomicU32::new(0);

        let work = &work;
        let key = &key;
        let attempts = &attempts;

        let result = RetryIf::start(
            self.policy.strategy(),
            move || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                self.attempt(id, key, attempt, work)
            },
            |e: &BillingError| {
                let retry = e.is_local_conflict();
                if retry {
                    tracing::debug!(
                        operation = operation,
                        user_subscription_id = %id,
                        attempt = attempts.load(Ordering::Relaxed),
                        "Local write conflict - will retry"
                    );
                }
                retry
            },
        )
        .await;

        match result {
            Err(BillingError::LocalConflict(detail)) => {
                tracing::warn!(
                    operation = operation,
                    user_subscription_id = %id,
                    attempts = attempts.load(Ordering::Relaxed),
                    "Retry budget exhausted"
                );
                Err(BillingError::ConcurrentModification(detail))
            }
            other => other,
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        id: &UserSubscriptionId,
        key: &IdempotencyKey,
        attempt: u32,
        work: &F,
    ) -> BillingResult<T>
    where
        F: Fn(TxContext) -> Fut,
        Fut: Future<Output = BillingResult<TxOutcome<T>>>,
    {
        let snapshot = self.store.get(id).await?;
        let (record, precondition) = match snapshot {
            Some(versioned) => (Some(versioned.value), Precondition::Version(versioned.version)),
            None => (None, Precondition::Absent),
        };

        let outcome = work(TxContext {
            record,
            key: key.clone(),
            attempt,
        })
        .await?;

        if let Some(record) = &outcome.write {
            let version = self.store.commit(record, precondition).await?;
            tracing::debug!(
                user_subscription_id = %id,
                version = version,
                attempt = attempt,
                "Committed user subscription"
            );
        }

        Ok(outcome.value)
    }
}

/// Settle a provider result. An idempotent replay means an earlier attempt already
/// reached the provider with this key, so the authoritative state is fetched through
/// `recover` instead. Every other failure aborts.
pub async fn recover_replay<T, R, Fut>(
    operation: &str,
    result: GatewayResult<T>,
    recover: R,
) -> BillingResult<T>
where
    R: FnOnce() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    match result {
        Ok(value) => Ok(value),
        Err(GatewayError::IdempotentReplay) => {
            tracing::warn!(
                operation = operation,
                "Idempotency key already used - recovering remote state"
            );
            recover().await
        }
        Err(e) => {
            tracing::error!(operation = operation, error = %e, "Billing provider call failed");
            Err(e.into())
        }
    }
}
