//! Identifier types used across the subscription sync engine

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InvalidId;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal, [$($reserved:literal),*]) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            const RESERVED: &'static [char] = &[$($reserved),*];

            /// Validate and wrap a raw identifier
            pub fn new(value: impl Into<String>) -> Result<Self, InvalidId> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(InvalidId::Empty($kind));
                }
                if value.contains(Self::RESERVED) {
                    return Err(InvalidId::ReservedCharacter {
                        kind: $kind,
                        value,
                    });
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidId;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Billing provider customer id (e.g. `cus_...`)
    ///
    /// `-` is reserved because it separates the parts of a [`UserSubscriptionId`].
    CustomerId,
    "customer id",
    ['-']
);

string_id!(
    /// Catalog subscription id
    SubscriptionId,
    "subscription id",
    []
);

string_id!(
    /// Plan id, unique within its catalog subscription
    PlanId,
    "plan id",
    []
);

/// Id of a customer's subscription record.
///
/// Always derived from the (customer, subscription) pair, never supplied by a caller,
/// so there is exactly one record per pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserSubscriptionId(String);

impl UserSubscriptionId {
    pub fn derive(customer_id: &CustomerId, subscription_id: &SubscriptionId) -> Self {
        Self(format!("{}-{}", customer_id, subscription_id))
    }

    /// Rehydrate an id read back from storage
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
