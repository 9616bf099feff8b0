//! In-process stores, used by tests and local development

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use subsync_shared::{SubscriptionId, UserSubscriptionId};

use crate::catalog::{CatalogStore, Subscription};
use crate::error::{BillingError, BillingResult};
use crate::model::UserSubscription;
use crate::store::{Precondition, UserSubscriptionStore, Versioned};

#[derive(Default)]
struct Records {
    rows: HashMap<String, Versioned<UserSubscription>>,
    commits: usize,
    forced_conflicts: usize,
}

/// User-subscription store with the same compare-and-set semantics as the Postgres one
#[derive(Default)]
pub struct InMemoryUserSubscriptionStore {
    records: Mutex<Records>,
}

impl InMemoryUserSubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BillingResult<std::sync::MutexGuard<'_, Records>> {
        self.records
            .lock()
            .map_err(|_| BillingError::Internal("subscription store lock poisoned".to_string()))
    }

    /// Make the next `n` commits fail with a conflict, as if another writer got there first
    pub fn fail_next_commits(&self, n: usize) -> BillingResult<()> {
        self.lock()?.forced_conflicts = n;
        Ok(())
    }

    /// Number of successful commits so far
    pub fn commit_count(&self) -> BillingResult<usize> {
        Ok(self.lock()?.commits)
    }

    pub fn len(&self) -> BillingResult<usize> {
        Ok(self.lock()?.rows.len())
    }

    pub fn is_empty(&self) -> BillingResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl UserSubscriptionStore for InMemoryUserSubscriptionStore {
    async fn get(&self, id: &UserSubscriptionId) -> BillingResult<Option<Versioned<UserSubscription>>> {
        Ok(self.lock()?.rows.get(id.as_str()).cloned())
    }

    async fn commit(&self, record: &UserSubscription, precondition: Precondition) -> BillingResult<u64> {
        let mut records = self.lock()?;

        if records.forced_conflicts > 0 {
            records.forced_conflicts -= 1;
            return Err(BillingError::LocalConflict(format!(
                "user subscription {} changed since it was read",
                record.id
            )));
        }

        let current = records.rows.get(record.id.as_str()).map(|r| r.version);
        let version = match (precondition, current) {
            (Precondition::Absent, None) => 1,
            (Precondition::Version(expected), Some(stored)) if expected == stored => stored + 1,
            _ => {
                return Err(BillingError::LocalConflict(format!(
                    "user subscription {} changed since it was read",
                    record.id
                )))
            }
        };

        records.rows.insert(
            record.id.as_str().to_string(),
            Versioned {
                value: record.clone(),
                version,
            },
        );
        records.commits += 1;
        Ok(version)
    }

    async fn health_check(&self) -> BillingResult<()> {
        self.lock().map(|_| ())
    }
}

/// Fixed catalog
#[derive(Default)]
pub struct InMemoryCatalogStore {
    subscriptions: HashMap<String, Subscription>,
}

impl InMemoryCatalogStore {
    pub fn new(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        Self {
            subscriptions: subscriptions
                .into_iter()
                .map(|s| (s.id.to_string(), s))
                .collect(),
        }
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn get_subscription(&self, id: &SubscriptionId) -> BillingResult<Option<Subscription>> {
        Ok(self.subscriptions.get(id.as_str()).cloned())
    }
}
