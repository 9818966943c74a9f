//! Downstream Notifier
//!
//! Forwards applied transitions to the merchant callback URL. Jobs go through
//! a bounded queue drained by a fixed worker pool; each job gets a small retry
//! budget with a per-attempt timeout. Exhausting the budget is logged and
//! counted, never rolled back into the order: settlement is the source of truth.
//!
//! A full queue sheds the notification instead of buffering it elsewhere.
//! The order state is already committed; merchants converge through their
//! own status query.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::transition::Transition;
use crate::database::RefundStatus;
use crate::middleware::logging::log_external_call;
use crate::payments::signature::{HmacSha256Scheme, SignatureEncoding, SignatureScheme};
use crate::payments::{EventKind, ProviderName};

pub const SIGNATURE_HEADER: &str = "X-Paygate-Signature";

// ============================================================================
// Payload
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyOutcome {
    Success,
    Failed,
    RefundSucceeded,
    RefundFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub order_ref: String,
    pub outcome: NotifyOutcome,
    pub settled_amount: Option<i64>,
    pub provider_txn_id: Option<String>,
    pub notify_type: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_ref: Option<String>,
    pub provider: ProviderName,
}

impl NotificationPayload {
    pub fn from_transition(transition: &Transition) -> Self {
        let order = &transition.order;
        match &transition.refund {
            Some(refund) => Self {
                order_ref: order.order_ref.clone(),
                outcome: if refund.status == RefundStatus::Succeeded {
                    NotifyOutcome::RefundSucceeded
                } else {
                    NotifyOutcome::RefundFailed
                },
                settled_amount: Some(refund.amount),
                provider_txn_id: order.provider_txn_id.clone(),
                notify_type: EventKind::Refund,
                refund_ref: Some(refund.refund_ref.clone()),
                provider: order.provider,
            },
            None => Self {
                order_ref: order.order_ref.clone(),
                outcome: if order.settled_amount.is_some() {
                    NotifyOutcome::Success
                } else {
                    NotifyOutcome::Failed
                },
                settled_amount: order.settled_amount,
                provider_txn_id: order.provider_txn_id.clone(),
                notify_type: EventKind::Payment,
                refund_ref: None,
                provider: order.provider,
            },
        }
    }
}

// ============================================================================
// Errors and metrics
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid callback url: {0}")]
    InvalidUrl(String),

    #[error("notifier is shut down")]
    Closed,

    #[error("notification queue is full")]
    QueueFull,

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("callback returned status {0}")]
    Status(u16),
}

#[derive(Debug, Default)]
pub struct NotifierMetrics {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    /// Shed because the queue was full
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotifierMetricsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retries: u64,
    pub dropped: u64,
}

impl NotifierMetrics {
    pub fn snapshot(&self) -> NotifierMetricsSnapshot {
        NotifierMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Where applied transitions are announced. `dispatch` only enqueues.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn dispatch(
        &self,
        callback_url: String,
        payload: NotificationPayload,
    ) -> Result<(), NotifyError>;
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    /// Enables the `X-Paygate-Signature` header
    pub signing_secret: Option<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            max_attempts: 3,
            attempt_timeout_ms: 3_000,
            retry_backoff_ms: 500,
            signing_secret: None,
        }
    }
}

impl fmt::Debug for NotifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierConfig")
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_attempts", &self.max_attempts)
            .field("attempt_timeout_ms", &self.attempt_timeout_ms)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("signing_secret", &self.signing_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

struct Job {
    callback_url: String,
    payload: NotificationPayload,
}

struct Deliverer {
    http: reqwest::Client,
    signer: Option<HmacSha256Scheme>,
    max_attempts: u32,
    attempt_timeout: Duration,
    retry_backoff: Duration,
    metrics: Arc<NotifierMetrics>,
}

impl Deliverer {
    async fn deliver(&self, job: Job) {
        let body = match serde_json::to_vec(&job.payload) {
            Ok(body) => body,
            Err(e) => {
                error!(order_ref = %job.payload.order_ref, error = %e, "Failed to encode notification");
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        for attempt in 1..=self.max_attempts {
            match self.attempt(&job.callback_url, &body).await {
                Ok(()) => {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                    info!(
                        order_ref = %job.payload.order_ref,
                        notify_type = %job.payload.notify_type,
                        attempt,
                        "Downstream notification delivered"
                    );
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        order_ref = %job.payload.order_ref,
                        attempt,
                        error = %e,
                        "Downstream notification attempt failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        order_ref = %job.payload.order_ref,
                        notify_type = %job.payload.notify_type,
                        attempts = attempt,
                        error = %e,
                        "Downstream notification abandoned after retry budget"
                    );
                }
            }
        }
    }

    async fn attempt(&self, url: &str, body: &[u8]) -> Result<(), NotifyError> {
        let mut request = self
            .http
            .post(url)
            .timeout(self.attempt_timeout)
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        if let Some(signer) = &self.signer {
            let signature = signer
                .sign(body)
                .map_err(|e| NotifyError::Delivery(e.to_string()))?;
            request = request.header(SIGNATURE_HEADER, signature);
        }

        log_external_call("merchant_callback", url, async {
            let response = request
                .send()
                .await
                .map_err(|e| NotifyError::Delivery(e.to_string()))?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(NotifyError::Status(status.as_u16()))
            }
        })
        .await
    }
}

/// Bounded worker pool delivering notifications over HTTP
pub struct DownstreamNotifier {
    tx: mpsc::Sender<Job>,
    metrics: Arc<NotifierMetrics>,
}

impl DownstreamNotifier {
    /// Spawns the worker pool. Workers exit once the notifier is dropped and
    /// the queue is drained.
    pub fn start(config: NotifierConfig, http: reqwest::Client) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let metrics = Arc::new(NotifierMetrics::default());

        let deliverer = Arc::new(Deliverer {
            http,
            signer: config
                .signing_secret
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|s| HmacSha256Scheme::new(s.clone().into_bytes(), SignatureEncoding::Hex)),
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            metrics: metrics.clone(),
        });

        let workers = config.workers.max(1);
        for worker_id in 0..workers {
            let rx = rx.clone();
            let deliverer = deliverer.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => deliverer.deliver(job).await,
                        None => break,
                    }
                }
                debug!(worker_id, "Notifier worker stopped");
            });
        }
        info!(workers, queue_capacity = config.queue_capacity, "Downstream notifier started");

        Self { tx, metrics }
    }

    pub fn metrics(&self) -> NotifierMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared counters, readable after the notifier is moved behind a trait object
    pub fn metrics_handle(&self) -> Arc<NotifierMetrics> {
        self.metrics.clone()
    }
}

#[async_trait]
impl NotificationSink for DownstreamNotifier {
    async fn dispatch(
        &self,
        callback_url: String,
        payload: NotificationPayload,
    ) -> Result<(), NotifyError> {
        url::Url::parse(&callback_url).map_err(|e| NotifyError::InvalidUrl(e.to_string()))?;

        let job = Job {
            callback_url,
            payload,
        };
        match self.tx.try_send(job) {
            Ok(()) => {
                self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    order_ref = %job.payload.order_ref,
                    notify_type = %job.payload.notify_type,
                    "Notification queue full, dropping notification"
                );
                Err(NotifyError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NotifyError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Order, OrderStatus};
    use chrono::Utc;

    fn order(settled: Option<i64>) -> Order {
        let now = Utc::now();
        Order {
            id: 1,
            order_ref: "OUT123".to_string(),
            app_id: "app".to_string(),
            provider: ProviderName::Alipay,
            provider_txn_id: Some("TXN".to_string()),
            amount: 1000,
            currency: "CNY".to_string(),
            callback_url: "http://127.0.0.1:1/cb".to_string(),
            status: if settled.is_some() { OrderStatus::Paid } else { OrderStatus::Failed },
            settled_amount: settled,
            needs_review: false,
            created_at: now,
            updated_at: now,
            settled_at: Some(now),
        }
    }

    #[test]
    fn test_payload_wire_format() {
        let transition = Transition {
            applied: true,
            order: order(Some(1000)),
            refund: None,
            needs_review: false,
        };
        let payload = NotificationPayload::from_transition(&transition);
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["orderRef"], "OUT123");
        assert_eq!(value["outcome"], "SUCCESS");
        assert_eq!(value["settledAmount"], 1000);
        assert_eq!(value["providerTxnId"], "TXN");
        assert_eq!(value["notifyType"], "payment");
        assert!(value.get("refundRef").is_none());
    }

    #[test]
    fn test_failed_payment_payload() {
        let transition = Transition {
            applied: true,
            order: order(None),
            refund: None,
            needs_review: false,
        };
        let payload = NotificationPayload::from_transition(&transition);
        assert_eq!(payload.outcome, NotifyOutcome::Failed);
        assert_eq!(payload.settled_amount, None);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_invalid_url() {
        let notifier = DownstreamNotifier::start(NotifierConfig::default(), reqwest::Client::new());
        let transition = Transition {
            applied: true,
            order: order(Some(1000)),
            refund: None,
            needs_review: false,
        };
        let result = notifier
            .dispatch(
                "not a url".to_string(),
                NotificationPayload::from_transition(&transition),
            )
            .await;
        assert!(matches!(result, Err(NotifyError::InvalidUrl(_))));
        assert_eq!(notifier.metrics().enqueued, 0);
    }
}
