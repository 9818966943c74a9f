//! Shared fixtures for integration tests
//!
//! - `FakeProvider`: scripted adapter (verify parses a tiny JSON body, query
//!   answers from a per-order script)
//! - `RecordingSink`: notification sink that keeps every payload
//! - `FailingStore`: order store whose every call fails
//! - helpers to seed orders and build a pipeline around an in-memory store

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use paygate::cache::{DedupLock, InMemoryDedupLock, LockKey};
use paygate::cache::CacheError;
use paygate::database::{
    InMemoryOrderStore, NewOrder, NewRefund, Order, OrderStatus, OrderStore, OrderUpdate, Refund,
    RefundCreation, RefundSettlement, RefundUpdate, StoreError,
};
use paygate::payments::{
    AckOutcome, EventOutcome, PaymentProvider, ProviderAck, ProviderError, ProviderName,
    RawCallback, RemoteStatus, VerifiedEvent,
};
use paygate::services::{
    NotificationPayload, NotificationPipeline, NotificationSink, NotifyError, TransitionConfig,
    TransitionEngine,
};

pub const FAKE_SIGNATURE_HEADER: &str = "x-fake-signature";
pub const FAKE_SIGNATURE: &str = "valid";

// ============================================================================
// Fake provider
// ============================================================================

pub enum QueryScript {
    Status(RemoteStatus),
    NotFound,
    Unavailable,
}

pub struct FakeProvider {
    name: ProviderName,
    app_id: String,
    script: Mutex<HashMap<String, QueryScript>>,
    query_delay: Duration,
    pub queries: AtomicUsize,
}

impl FakeProvider {
    pub fn new(name: ProviderName, app_id: &str) -> Self {
        Self {
            name,
            app_id: app_id.to_string(),
            script: Mutex::new(HashMap::new()),
            query_delay: Duration::ZERO,
            queries: AtomicUsize::new(0),
        }
    }

    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    pub async fn script(&self, order_ref: &str, answer: QueryScript) {
        self.script.lock().await.insert(order_ref.to_string(), answer);
    }

    /// Body accepted by `verify`
    pub fn payment_body(order_ref: &str, amount: i64, status: &str) -> Vec<u8> {
        json!({ "orderRef": order_ref, "amount": amount, "status": status, "txnId": format!("TXN-{}", order_ref) })
            .to_string()
            .into_bytes()
    }

    pub fn signed_callback(body: Vec<u8>) -> RawCallback {
        let mut headers = http::HeaderMap::new();
        headers.insert(FAKE_SIGNATURE_HEADER, http::HeaderValue::from_static(FAKE_SIGNATURE));
        headers.insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
        RawCallback::new(headers, body)
    }
}

pub fn paid_status(amount: i64) -> RemoteStatus {
    RemoteStatus::Paid {
        provider_txn_id: Some("REMOTE-TXN".to_string()),
        settled_amount: amount,
        paid_at: Some(Utc::now()),
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn name(&self) -> ProviderName {
        self.name
    }

    fn app_id(&self) -> &str {
        &self.app_id
    }

    fn verify(&self, callback: &RawCallback) -> Result<VerifiedEvent, ProviderError> {
        if callback.header(FAKE_SIGNATURE_HEADER) != Some(FAKE_SIGNATURE) {
            return Err(ProviderError::InvalidSignature("bad fake signature".to_string()));
        }
        let body: Value = serde_json::from_slice(&callback.body)?;
        let order_ref = body
            .get("orderRef")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::MalformedPayload("missing orderRef".to_string()))?;
        let amount = body.get("amount").and_then(Value::as_i64);
        let outcome = match body.get("status").and_then(Value::as_str) {
            Some("SUCCESS") => EventOutcome::Paid,
            Some("FAIL") => EventOutcome::PaymentFailed { reason: None },
            Some(other) => return Err(ProviderError::IgnoredEvent(other.to_string())),
            None => return Err(ProviderError::MalformedPayload("missing status".to_string())),
        };
        Ok(VerifiedEvent {
            provider: self.name,
            order_ref: order_ref.to_string(),
            provider_txn_id: body.get("txnId").and_then(Value::as_str).map(str::to_owned),
            settled_amount: amount,
            outcome,
            event_time: None,
        })
    }

    async fn query(&self, order_ref: &str) -> Result<RemoteStatus, ProviderError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if !self.query_delay.is_zero() {
            tokio::time::sleep(self.query_delay).await;
        }
        match self.script.lock().await.get(order_ref) {
            Some(QueryScript::Status(status)) => Ok(status.clone()),
            Some(QueryScript::Unavailable) => {
                Err(ProviderError::ProviderUnavailable("scripted outage".to_string()))
            }
            Some(QueryScript::NotFound) | None => Err(ProviderError::NotFound(order_ref.to_string())),
        }
    }

    fn acknowledge(&self, _callback: &RawCallback, outcome: &AckOutcome) -> ProviderAck {
        match outcome {
            AckOutcome::Accepted => ProviderAck::text(200, "success"),
            other => ProviderAck::text(other.http_status(), "fail"),
        }
    }
}

// ============================================================================
// Notification sink
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<(String, NotificationPayload)>>,
}

impl RecordingSink {
    pub async fn count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub async fn payloads(&self) -> Vec<NotificationPayload> {
        self.sent.lock().await.iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn dispatch(
        &self,
        callback_url: String,
        payload: NotificationPayload,
    ) -> Result<(), NotifyError> {
        self.sent.lock().await.push((callback_url, payload));
        Ok(())
    }
}

// ============================================================================
// Locks and stores
// ============================================================================

/// Always grants; models a lock whose TTL expired mid-processing
pub struct AlwaysGrantLock;

#[async_trait]
impl DedupLock for AlwaysGrantLock {
    async fn acquire(&self, _key: &LockKey, _holder: &str, _ttl: Duration) -> Result<bool, CacheError> {
        Ok(true)
    }

    async fn release(&self, _key: &LockKey, _holder: &str) -> Result<bool, CacheError> {
        Ok(true)
    }
}

/// Lock backend that is down
pub struct BrokenLock;

#[async_trait]
impl DedupLock for BrokenLock {
    async fn acquire(&self, _key: &LockKey, _holder: &str, _ttl: Duration) -> Result<bool, CacheError> {
        Err(CacheError::Pool("connection refused".to_string()))
    }

    async fn release(&self, _key: &LockKey, _holder: &str) -> Result<bool, CacheError> {
        Err(CacheError::Pool("connection refused".to_string()))
    }
}

pub struct FailingStore;

fn down() -> StoreError {
    StoreError::corrupt("database unavailable")
}

#[async_trait]
impl OrderStore for FailingStore {
    async fn insert_order(&self, _order: NewOrder) -> Result<Order, StoreError> {
        Err(down())
    }

    async fn find_order(&self, _order_ref: &str) -> Result<Option<Order>, StoreError> {
        Err(down())
    }

    async fn compare_and_set_order(
        &self,
        _order_ref: &str,
        _expected: OrderStatus,
        _update: OrderUpdate,
    ) -> Result<Option<Order>, StoreError> {
        Err(down())
    }

    async fn list_pending_page(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        _after_id: i64,
        _limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        Err(down())
    }

    async fn find_refund(&self, _refund_ref: &str) -> Result<Option<Refund>, StoreError> {
        Err(down())
    }

    async fn list_refunds(&self, _order_ref: &str) -> Result<Vec<Refund>, StoreError> {
        Err(down())
    }

    async fn create_refund(&self, _refund: NewRefund) -> Result<RefundCreation, StoreError> {
        Err(down())
    }

    async fn settle_refund(
        &self,
        _order_ref: &str,
        _refund_ref: &str,
        _update: RefundUpdate,
    ) -> Result<RefundSettlement, StoreError> {
        Err(down())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn new_order(order_ref: &str, provider: ProviderName, amount: i64) -> NewOrder {
    NewOrder {
        order_ref: order_ref.to_string(),
        app_id: "fake-app".to_string(),
        provider,
        amount,
        currency: "CNY".to_string(),
        callback_url: "http://127.0.0.1:9/merchant/notify".to_string(),
    }
}

pub async fn seed_order(store: &InMemoryOrderStore, order_ref: &str, provider: ProviderName, amount: i64) -> Order {
    store
        .insert_order(new_order(order_ref, provider, amount))
        .await
        .expect("seed order")
}

pub fn paid_event(provider: ProviderName, order_ref: &str, amount: i64) -> VerifiedEvent {
    VerifiedEvent {
        provider,
        order_ref: order_ref.to_string(),
        provider_txn_id: Some(format!("TXN-{}", order_ref)),
        settled_amount: Some(amount),
        outcome: EventOutcome::Paid,
        event_time: None,
    }
}

pub struct Harness {
    pub store: Arc<InMemoryOrderStore>,
    pub sink: Arc<RecordingSink>,
    pub engine: Arc<TransitionEngine>,
    pub pipeline: Arc<NotificationPipeline>,
}

pub fn harness_with_lock(lock: Arc<dyn DedupLock>) -> Harness {
    let store = Arc::new(InMemoryOrderStore::new());
    let sink = Arc::new(RecordingSink::default());
    let engine = Arc::new(TransitionEngine::new(store.clone(), TransitionConfig::default()));
    let pipeline = Arc::new(NotificationPipeline::new(
        lock,
        engine.clone(),
        sink.clone(),
        Duration::from_secs(10),
    ));
    Harness {
        store,
        sink,
        engine,
        pipeline,
    }
}

pub fn harness() -> Harness {
    harness_with_lock(Arc::new(InMemoryDedupLock::new()))
}
