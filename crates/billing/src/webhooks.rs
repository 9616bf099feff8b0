//! Stripe webhook handling
//!
//! Signatures are verified manually so the event envelope can be parsed with our own
//! minimal schema instead of the SDK's, which lags behind newer Stripe API versions.
//! Only the correlation ids are taken from the payload. Everything else is pulled from
//! Stripe again before it is applied.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subsync_shared::{CustomerId, PlanId, UserSubscriptionId};

use crate::coordinator::{TransactionCoordinator, TxOutcome};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{BillingGateway, Correlation};
use crate::model::SubscriptionStatus;

type HmacSha256 = Hmac<Sha256>;

/// Default upper bound on an accepted webhook body
pub const DEFAULT_MAX_BODY_BYTES: usize = 65_536;
/// Default allowed clock skew between Stripe and us, in seconds
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

pub const PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const PAYMENT_FAILED: &str = "invoice.payment_failed";

/// Minimal Stripe event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// The invoice fields used for correlation; amounts and periods are never read
#[derive(Debug, Clone, Deserialize)]
struct InvoiceRef {
    customer: Option<CustomerRef>,
    #[serde(default)]
    lines: InvoiceLines,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CustomerRef {
    Id(String),
    Object { id: String },
}

impl CustomerRef {
    fn id(&self) -> &str {
        match self {
            CustomerRef::Id(id) => id,
            CustomerRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InvoiceLines {
    #[serde(default)]
    data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Deserialize)]
struct InvoiceLine {
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

/// Verifies `Stripe-Signature` headers against the endpoint secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
    max_body_bytes: usize,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Verify and parse an event at the current time
    pub fn verify(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_at(payload, signature, time::OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify and parse an event as of `now` (epoch seconds)
    pub fn verify_at(&self, payload: &[u8], signature: &str, now: i64) -> BillingResult<WebhookEvent> {
        if payload.len() > self.max_body_bytes {
            return Err(BillingError::WebhookPayloadTooLarge {
                size: payload.len(),
                limit: self.max_body_bytes,
            });
        }

        // Header format: t=timestamp,v1=signature[,v1=signature...][,v0=...]
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();

        for part in signature.split(',') {
            let kv: Vec<&str> = part.trim().splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => {
                        if let Ok(bytes) = hex::decode(kv[1]) {
                            candidates.push(bytes);
                        }
                    }
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        if (now - timestamp).abs() > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mac = self.mac(timestamp, payload)?;
        // verify_slice compares in constant time
        if !candidates
            .iter()
            .any(|candidate| mac.clone().verify_slice(candidate).is_ok())
        {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookPayloadInvalid(e.to_string())
        })
    }

    /// Build a `Stripe-Signature` header value for a payload
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> BillingResult<String> {
        let mac = self.mac(timestamp, payload)?;
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> BillingResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}

/// What the reconciler did with a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Verified, but not an event type we act on
    Ignored { event_type: String },
    /// No local record matches the invoice's correlation
    Unmatched { event_id: String },
    /// The record was refreshed from Stripe
    Renewed {
        user_subscription_id: UserSubscriptionId,
        status: SubscriptionStatus,
        /// Plan promoted from the queued change, if the period rolled over
        promoted: Option<PlanId>,
    },
}

/// Applies invoice payment events to user subscriptions
pub struct RenewalReconciler {
    verifier: WebhookVerifier,
    gateway: Arc<dyn BillingGateway>,
    coordinator: Arc<TransactionCoordinator>,
}

impl RenewalReconciler {
    pub fn new(
        verifier: WebhookVerifier,
        gateway: Arc<dyn BillingGateway>,
        coordinator: Arc<TransactionCoordinator>,
    ) -> Self {
        Self {
            verifier,
            gateway,
            coordinator,
        }
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    /// Verify a raw delivery and reconcile it
    pub async fn handle(&self, payload: &[u8], signature: &str) -> BillingResult<ReconcileOutcome> {
        let event = self.verifier.verify(payload, signature)?;
        self.reconcile(event).await
    }

    /// Reconcile an already verified event
    pub async fn reconcile(&self, event: WebhookEvent) -> BillingResult<ReconcileOutcome> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook"
        );

        if event.event_type != PAYMENT_SUCCEEDED && event.event_type != PAYMENT_FAILED {
            tracing::debug!(event_type = %event.event_type, "Ignoring webhook event type");
            return Ok(ReconcileOutcome::Ignored {
                event_type: event.event_type,
            });
        }

        let (customer_id, correlation) = extract_correlation(&event)?;
        let id = UserSubscriptionId::derive(&customer_id, &correlation.subscription_id);
        let gateway = self.gateway.as_ref();
        let id_ref = &id;

        let result = self
            .coordinator
            .run("renewal", &id, move |ctx| async move {
                let Some(mut record) = ctx.record else {
                    return Ok(TxOutcome::read_only(None));
                };

                let remote = gateway
                    .get_subscription(&record.stripe_subscription_id)
                    .await
                    .map_err(BillingError::from)?;

                let promoted = if record.has_rolled_over(&remote)? {
                    record.promote_pending()
                } else {
                    None
                };
                record.apply_remote(&remote)?;

                let outcome = ReconcileOutcome::Renewed {
                    user_subscription_id: id_ref.clone(),
                    status: record.status,
                    promoted,
                };
                Ok(TxOutcome::write(record, Some(outcome)))
            })
            .await?;

        match result {
            Some(outcome) => {
                if let ReconcileOutcome::Renewed {
                    status, promoted, ..
                } = &outcome
                {
                    tracing::info!(
                        event_id = %event.id,
                        customer_id = %customer_id,
                        subscription_id = %correlation.subscription_id,
                        status = %status,
                        promoted_plan_id = ?promoted.as_ref().map(|p| p.as_str()),
                        "Reconciled subscription from invoice event"
                    );
                }
                Ok(outcome)
            }
            None => {
                tracing::warn!(
                    event_id = %event.id,
                    customer_id = %customer_id,
                    subscription_id = %correlation.subscription_id,
                    "No user subscription matches invoice event"
                );
                Ok(ReconcileOutcome::Unmatched { event_id: event.id })
            }
        }
    }
}

/// Pull the customer id and catalog correlation out of an invoice event
fn extract_correlation(event: &WebhookEvent) -> BillingResult<(CustomerId, Correlation)> {
    let invoice: InvoiceRef = serde_json::from_value(event.data.object.clone())
        .map_err(|e| BillingError::WebhookPayloadInvalid(format!("invoice: {}", e)))?;

    let customer = invoice
        .customer
        .ok_or_else(|| BillingError::WebhookPayloadInvalid("invoice has no customer".to_string()))?;
    let customer_id = CustomerId::new(customer.id())
        .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

    let correlation = invoice
        .lines
        .data
        .iter()
        .find_map(|line| Correlation::from_metadata(&line.metadata))
        .ok_or_else(|| {
            BillingError::WebhookPayloadInvalid(
                "invoice lines carry no subscription correlation".to_string(),
            )
        })?;

    Ok((customer_id, correlation))
}
