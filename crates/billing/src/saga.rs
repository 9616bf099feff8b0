//! Recreate saga
//!
//! Replacing a customer's remote subscription spans two provider mutations and one local
//! write. Each phase has a name so an abort reports where it stopped. Nothing is written
//! locally until every phase before the commit has succeeded, and the retire phase
//! tolerates a subscription that is already gone, so running the whole saga again is the
//! recovery path after any abort.

use std::fmt;

use crate::error::BillingError;
use crate::gateway::{BillingGateway, GatewayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaPhase {
    /// Cancel the remote subscription the record points at
    RetirePrevious,
    /// Create the replacement remote subscription
    CreateReplacement,
    /// Overwrite the local record with the replacement
    CommitLocal,
}

impl SagaPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaPhase::RetirePrevious => "retire_previous",
            SagaPhase::CreateReplacement => "create_replacement",
            SagaPhase::CommitLocal => "commit_local",
        }
    }

    /// Wrap a failure as an abort of this phase
    pub fn abort(self, source: BillingError) -> BillingError {
        tracing::error!(phase = %self, error = %source, "Recreate aborted");
        BillingError::SagaAborted {
            phase: self,
            source: Box::new(source),
        }
    }
}

impl fmt::Display for SagaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the retire phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireOutcome {
    Cancelled,
    /// The provider had already stopped billing it
    AlreadyTerminal,
    /// The provider no longer knows it
    Missing,
}

/// Cancel the remote subscription unless it is already terminal or gone
pub async fn retire_remote(
    gateway: &dyn BillingGateway,
    stripe_subscription_id: &str,
) -> Result<RetireOutcome, BillingError> {
    match gateway.get_subscription(stripe_subscription_id).await {
        Ok(remote) if remote.status.is_terminal() => return Ok(RetireOutcome::AlreadyTerminal),
        Ok(_) => {}
        Err(GatewayError::NotFound(_)) => return Ok(RetireOutcome::Missing),
        Err(e) => return Err(e.into()),
    }

    match gateway.cancel_subscription(stripe_subscription_id).await {
        Ok(_) => Ok(RetireOutcome::Cancelled),
        // Lost a race with another cancellation
        Err(GatewayError::NotFound(_)) => Ok(RetireOutcome::Missing),
        Err(e) => Err(e.into()),
    }
}
