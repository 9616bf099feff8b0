//! Test harness: a scripted in-process Stripe stand-in wired to in-memory stores

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use subsync_billing::{
    BillingGateway, BillingResult, Correlation, GatewayError, GatewayResult, IdempotencyKey,
    InMemoryCatalogStore, InMemoryUserSubscriptionStore, NewRemoteSubscription,
    PaymentIntentStatus, PaymentIntentSummary, Plan, Precondition, ReconcileOutcome,
    RemoteSubscription, RemoteSubscriptionItem, RemoteSubscriptionUpdate, RenewalReconciler,
    RetryPolicy, Subscription, SubscriptionLifecycle, SubscriptionStatus,
    TransactionCoordinator, UserSubscription, UserSubscriptionStore, Versioned, WebhookVerifier,
};
use subsync_shared::{CustomerId, PlanId, SubscriptionId, UserSubscriptionId};

pub const WEBHOOK_SECRET: &str = "whsec_integration";
pub const PERIOD: i64 = 30 * 86_400;
const START: i64 = 1_700_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    UpdateItem,
    Update,
    Cancel,
    Get,
    Find,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub key: Option<String>,
    pub outcome: &'static str,
}

#[derive(Default)]
struct FakeState {
    clock: i64,
    next_id: u32,
    subscriptions: HashMap<String, RemoteSubscription>,
    default_sources: HashMap<String, String>,
    used_keys: HashSet<String>,
    failures: HashMap<Op, VecDeque<GatewayError>>,
    calls: Vec<Call>,
}

impl FakeState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn scripted(&mut self, op: Op, key: Option<&IdempotencyKey>) -> GatewayResult<()> {
        if let Some(err) = self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            self.log(op, key, "failed");
            return Err(err);
        }
        if let Some(key) = key {
            if !self.used_keys.insert(key.as_str().to_string()) {
                self.log(op, Some(key), "replayed");
                return Err(GatewayError::IdempotentReplay);
            }
        }
        Ok(())
    }

    fn log(&mut self, op: Op, key: Option<&IdempotencyKey>, outcome: &'static str) {
        self.calls.push(Call {
            op,
            key: key.map(|k| k.as_str().to_string()),
            outcome,
        });
    }

    fn new_intent(&mut self, status: PaymentIntentStatus) -> PaymentIntentSummary {
        let id = format!("pi_{}", self.next_id());
        PaymentIntentSummary {
            client_secret: Some(format!("{}_secret", id)),
            id,
            status,
        }
    }

    fn subscription_mut(&mut self, id: &str) -> GatewayResult<&mut RemoteSubscription> {
        self.subscriptions
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("No such subscription: '{}'", id)))
    }
}

/// Behaves like Stripe for the calls the engine makes: keys are single-use, cancelled
/// subscriptions stay retrievable, periods move only when told to
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        let gateway = Self::default();
        gateway.state.lock().unwrap().clock = START;
        gateway
    }

    pub fn fail_next(&self, op: Op, err: GatewayError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn remote(&self, id: &str) -> RemoteSubscription {
        self.state.lock().unwrap().subscriptions[id].clone()
    }

    pub fn default_source(&self, id: &str) -> Option<String> {
        self.state.lock().unwrap().default_sources.get(id).cloned()
    }

    /// Subscriptions Stripe would still bill
    pub fn live_subscriptions(&self, customer_id: &str) -> Vec<RemoteSubscription> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| s.customer_id == customer_id && !s.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn advance_clock(&self, seconds: i64) {
        self.state.lock().unwrap().clock += seconds;
    }

    /// Roll a subscription into its next period with a paid invoice
    pub fn renew(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        let intent = state.new_intent(PaymentIntentStatus::Succeeded);
        let sub = state.subscriptions.get_mut(id).unwrap();
        sub.current_period_start = sub.current_period_end;
        sub.current_period_end += PERIOD;
        sub.status = SubscriptionStatus::Active;
        sub.latest_payment_intent = Some(intent);
    }

    pub fn set_status(&self, id: &str, status: SubscriptionStatus) {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get_mut(id)
            .unwrap()
            .status = status;
    }

    /// Forget a subscription entirely, as if deleted on the dashboard
    pub fn delete(&self, id: &str) {
        self.state.lock().unwrap().subscriptions.remove(id);
    }
}

#[async_trait]
impl BillingGateway for FakeGateway {
    async fn create_subscription(
        &self,
        request: &NewRemoteSubscription,
        key: &IdempotencyKey,
    ) -> GatewayResult<RemoteSubscription> {
        let mut state = self.state.lock().unwrap();
        state.scripted(Op::Create, Some(key))?;

        let n = state.next_id();
        let intent = state.new_intent(PaymentIntentStatus::RequiresPaymentMethod);
        let subscription = RemoteSubscription {
            id: format!("sub_{}", n),
            customer_id: request.customer_id.to_string(),
            status: SubscriptionStatus::Incomplete,
            current_period_start: state.clock,
            current_period_end: state.clock + PERIOD,
            cancel_at_period_end: false,
            items: vec![RemoteSubscriptionItem {
                id: format!("si_{}", n),
                price_id: request.price_id.clone(),
            }],
            metadata: request.correlation.to_metadata(),
            latest_payment_intent: Some(intent),
        };
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        state.log(Op::Create, Some(key), "ok");
        Ok(subscription)
    }

    async fn update_subscription_item(
        &self,
        item_id: &str,
        price_id: &str,
        key: &IdempotencyKey,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        state.scripted(Op::UpdateItem, Some(key))?;

        let item = state
            .subscriptions
            .values_mut()
            .flat_map(|s| s.items.iter_mut())
            .find(|i| i.id == item_id)
            .ok_or_else(|| GatewayError::NotFound(format!("No such item: '{}'", item_id)))?;
        item.price_id = price_id.to_string();
        state.log(Op::UpdateItem, Some(key), "ok");
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &RemoteSubscriptionUpdate,
        key: Option<&IdempotencyKey>,
    ) -> GatewayResult<RemoteSubscription> {
        let mut state = self.state.lock().unwrap();
        state.scripted(Op::Update, key)?;

        let clock = state.clock;
        let intent = if update.reset_billing_cycle {
            Some(state.new_intent(PaymentIntentStatus::RequiresPaymentMethod))
        } else {
            None
        };
        if let Some(source) = &update.default_source {
            state
                .default_sources
                .insert(subscription_id.to_string(), source.clone());
        }

        let sub = state.subscription_mut(subscription_id)?;
        if let Some((item_id, price_id)) = &update.item_price {
            if let Some(item) = sub.items.iter_mut().find(|i| &i.id == item_id) {
                item.price_id = price_id.clone();
            }
        }
        if let Some(plan_id) = &update.plan_id {
            sub.metadata
                .insert("plan_id".to_string(), plan_id.to_string());
        }
        if let Some(cancel) = update.cancel_at_period_end {
            sub.cancel_at_period_end = cancel;
        }
        if let Some(intent) = intent {
            sub.current_period_start = clock;
            sub.current_period_end = clock + PERIOD;
            sub.latest_payment_intent = Some(intent);
        }
        let sub = sub.clone();
        state.log(Op::Update, key, "ok");
        Ok(sub)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> GatewayResult<RemoteSubscription> {
        let mut state = self.state.lock().unwrap();
        state.scripted(Op::Cancel, None)?;

        let sub = state.subscription_mut(subscription_id)?;
        sub.status = SubscriptionStatus::Canceled;
        let sub = sub.clone();
        state.log(Op::Cancel, None, "ok");
        Ok(sub)
    }

    async fn get_subscription(&self, subscription_id: &str) -> GatewayResult<RemoteSubscription> {
        let mut state = self.state.lock().unwrap();
        state.scripted(Op::Get, None)?;
        let sub = state.subscription_mut(subscription_id)?.clone();
        state.log(Op::Get, None, "ok");
        Ok(sub)
    }

    async fn find_subscription(
        &self,
        customer_id: &CustomerId,
        correlation: &Correlation,
    ) -> GatewayResult<Option<RemoteSubscription>> {
        let mut state = self.state.lock().unwrap();
        state.scripted(Op::Find, None)?;
        let found = state
            .subscriptions
            .values()
            .find(|s| {
                s.customer_id == customer_id.as_str()
                    && !s.status.is_terminal()
                    && s.correlation().as_ref() == Some(correlation)
            })
            .cloned();
        state.log(Op::Find, None, "ok");
        Ok(found)
    }
}

/// Lets a second writer win the race: once armed, the next create call first creates
/// and commits a competing subscription, then proceeds as normal
pub struct ConcurrentWriter {
    fake: Arc<FakeGateway>,
    store: Arc<InMemoryUserSubscriptionStore>,
    armed: Mutex<Option<PlanId>>,
}

impl ConcurrentWriter {
    pub fn arm(&self, plan: &str) {
        *self.armed.lock().unwrap() = Some(plan_id(plan));
    }

    async fn commit_competing(&self, plan: PlanId) {
        let request = NewRemoteSubscription {
            customer_id: customer(),
            price_id: format!("price_{}", plan),
            correlation: Correlation::new(subscription(), plan.clone()),
        };
        let theirs = self
            .fake
            .create_subscription(&request, &IdempotencyKey::generate("competing"))
            .await
            .unwrap();

        let (record, precondition) = match self.store.get(&user_subscription_id()).await.unwrap() {
            None => (
                UserSubscription::create(
                    customer(),
                    subscription(),
                    plan,
                    &theirs,
                    time::OffsetDateTime::now_utc(),
                )
                .unwrap(),
                Precondition::Absent,
            ),
            Some(Versioned { mut value, version }) => {
                value.renew_all(plan, &theirs).unwrap();
                (value, Precondition::Version(version))
            }
        };
        self.store.commit(&record, precondition).await.unwrap();
    }
}

#[async_trait]
impl BillingGateway for ConcurrentWriter {
    async fn create_subscription(
        &self,
        request: &NewRemoteSubscription,
        key: &IdempotencyKey,
    ) -> GatewayResult<RemoteSubscription> {
        let armed = self.armed.lock().unwrap().take();
        if let Some(plan) = armed {
            self.commit_competing(plan).await;
        }
        self.fake.create_subscription(request, key).await
    }

    async fn update_subscription_item(
        &self,
        item_id: &str,
        price_id: &str,
        key: &IdempotencyKey,
    ) -> GatewayResult<()> {
        self.fake.update_subscription_item(item_id, price_id, key).await
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &RemoteSubscriptionUpdate,
        key: Option<&IdempotencyKey>,
    ) -> GatewayResult<RemoteSubscription> {
        self.fake.update_subscription(subscription_id, update, key).await
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> GatewayResult<RemoteSubscription> {
        self.fake.cancel_subscription(subscription_id).await
    }

    async fn get_subscription(&self, subscription_id: &str) -> GatewayResult<RemoteSubscription> {
        self.fake.get_subscription(subscription_id).await
    }

    async fn find_subscription(
        &self,
        customer_id: &CustomerId,
        correlation: &Correlation,
    ) -> GatewayResult<Option<RemoteSubscription>> {
        self.fake.find_subscription(customer_id, correlation).await
    }
}

pub fn customer() -> CustomerId {
    CustomerId::new("cus_1").unwrap()
}

pub fn subscription() -> SubscriptionId {
    SubscriptionId::new("s1").unwrap()
}

pub fn plan_id(id: &str) -> PlanId {
    PlanId::new(id).unwrap()
}

pub fn user_subscription_id() -> UserSubscriptionId {
    UserSubscriptionId::derive(&customer(), &subscription())
}

fn catalog_plan(id: &str, price: i64) -> Plan {
    Plan {
        id: plan_id(id),
        title: format!("Plan {}", id),
        stripe_product_id: format!("prod_{}", id),
        stripe_price_id: format!("price_{}", id),
        price,
        benefits: vec![],
    }
}

pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub store: Arc<InMemoryUserSubscriptionStore>,
    pub writer: Arc<ConcurrentWriter>,
    pub lifecycle: SubscriptionLifecycle,
    pub reconciler: RenewalReconciler,
}

impl Harness {
    pub fn new() -> Self {
        let gateway = Arc::new(FakeGateway::new());
        let store = Arc::new(InMemoryUserSubscriptionStore::new());
        let catalog = Arc::new(InMemoryCatalogStore::new([Subscription {
            id: subscription(),
            title: "Ramen club".to_string(),
            plans: vec![catalog_plan("p1", 3000), catalog_plan("p2", 5000)],
        }]));
        let coordinator = Arc::new(TransactionCoordinator::new(
            store.clone(),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        ));

        let writer = Arc::new(ConcurrentWriter {
            fake: gateway.clone(),
            store: store.clone(),
            armed: Mutex::new(None),
        });

        let lifecycle = SubscriptionLifecycle::new(catalog, writer.clone(), coordinator.clone());
        let reconciler =
            RenewalReconciler::new(WebhookVerifier::new(WEBHOOK_SECRET), gateway.clone(), coordinator);

        Self {
            gateway,
            store,
            writer,
            lifecycle,
            reconciler,
        }
    }

    pub async fn stored(&self) -> Option<Versioned<UserSubscription>> {
        self.store.get(&user_subscription_id()).await.unwrap()
    }

    pub async fn record(&self) -> UserSubscription {
        self.stored().await.expect("record exists").value
    }

    /// Sign and deliver an invoice event for the default customer and subscription
    pub async fn deliver(&self, event_type: &str, plan: &str) -> BillingResult<ReconcileOutcome> {
        let payload = invoice_event(event_type, "evt_1", "cus_1", "s1", plan);
        let header = self.sign(&payload);
        self.reconciler.handle(&payload, &header).await
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        WebhookVerifier::new(WEBHOOK_SECRET)
            .sign(time::OffsetDateTime::now_utc().unix_timestamp(), payload)
            .unwrap()
    }
}

pub fn invoice_event(
    event_type: &str,
    event_id: &str,
    customer: &str,
    subscription: &str,
    plan: &str,
) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": 1_700_000_000,
        "data": { "object": {
            "id": "in_1",
            "object": "invoice",
            "customer": customer,
            // Never trusted; the subscription is re-fetched
            "amount_paid": 1,
            "period_start": 0,
            "lines": { "data": [{
                "metadata": { "subscription_id": subscription, "plan_id": plan }
            }]}
        }}
    })
    .to_string()
    .into_bytes()
}
