//! Notification Pipeline
//!
//! verify -> dedup lock -> transition -> downstream notify -> unlock.
//! Both the webhook path and reconciliation go through [`NotificationPipeline::process`],
//! so they converge on the same invariants.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::notifier::{NotificationPayload, NotificationSink};
use super::transition::{Transition, TransitionEngine};
use crate::cache::{DedupLock, LockKey};
use crate::error::GatewayError;
use crate::logging::redact_sensitive_data;
use crate::payments::{AckOutcome, PaymentProvider, ProviderAck, RawCallback, VerifiedEvent};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

pub struct NotificationPipeline {
    lock: Arc<dyn DedupLock>,
    engine: Arc<TransitionEngine>,
    notifier: Arc<dyn NotificationSink>,
    lock_ttl: Duration,
}

impl NotificationPipeline {
    pub fn new(
        lock: Arc<dyn DedupLock>,
        engine: Arc<TransitionEngine>,
        notifier: Arc<dyn NotificationSink>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            lock,
            engine,
            notifier,
            lock_ttl,
        }
    }

    pub fn engine(&self) -> &Arc<TransitionEngine> {
        &self.engine
    }

    /// Handles one inbound provider delivery and returns the acknowledgement
    /// the provider expects. Never fails: every error maps to an ack.
    #[instrument(skip(self, provider, callback), fields(provider = %provider.name(), app_id = %provider.app_id()))]
    pub async fn ingest(&self, provider: &dyn PaymentProvider, callback: &RawCallback) -> ProviderAck {
        debug!(
            content_type = %callback.content_type(),
            body = %redact_sensitive_data(&String::from_utf8_lossy(&callback.body)),
            "Provider callback received"
        );

        let outcome = match provider.verify(callback) {
            Ok(event) => match self.process(event).await {
                Ok(_) => AckOutcome::Accepted,
                Err(e) => {
                    log_gateway_error(&e);
                    e.ack_outcome()
                }
            },
            Err(e) => {
                let e = GatewayError::from(e);
                log_gateway_error(&e);
                e.ack_outcome()
            }
        };

        provider.acknowledge(callback, &outcome)
    }

    /// Applies a verified event under the dedup lock and notifies downstream
    /// only when the transition was actually applied.
    ///
    /// `AlreadyProcessed` and `LockContention` are expected outcomes of
    /// duplicate delivery; both acknowledge as success.
    #[instrument(skip(self, event), fields(provider = %event.provider, order_ref = %event.order_ref, kind = %event.kind()))]
    pub async fn process(&self, event: VerifiedEvent) -> Result<Transition, GatewayError> {
        let key = LockKey::new(event.provider, &event.order_ref, event.kind());
        let holder = Uuid::new_v4().to_string();

        let locked = match self.lock.acquire(&key, &holder, self.lock_ttl).await {
            Ok(true) => true,
            Ok(false) => {
                info!(lock_key = %key, "Event already being handled by another worker");
                return Err(GatewayError::LockContention);
            }
            Err(e) => {
                // Advisory only; the conditional update still guards the order
                warn!(lock_key = %key, error = %e, "Dedup lock unavailable, continuing without it");
                false
            }
        };

        let result = self.engine.apply(&event.order_ref, &event).await;

        if let Ok(transition) = &result {
            if transition.applied {
                self.notify(transition).await;
            }
        }

        if locked {
            match self.lock.release(&key, &holder).await {
                Ok(true) => {}
                Ok(false) => warn!(lock_key = %key, "Dedup lock expired before release"),
                Err(e) => warn!(lock_key = %key, error = %e, "Failed to release dedup lock"),
            }
        }

        match result {
            Ok(transition) if transition.applied => Ok(transition),
            Ok(_) => Err(GatewayError::AlreadyProcessed),
            Err(e) => Err(e.into()),
        }
    }

    async fn notify(&self, transition: &Transition) {
        let payload = NotificationPayload::from_transition(transition);
        if let Err(e) = self
            .notifier
            .dispatch(transition.order.callback_url.clone(), payload)
            .await
        {
            warn!(
                order_ref = %transition.order.order_ref,
                error = %e,
                "Failed to enqueue downstream notification"
            );
        }
    }
}

fn log_gateway_error(err: &GatewayError) {
    match err {
        GatewayError::AlreadyProcessed | GatewayError::LockContention => {
            debug!(outcome = %err, "Duplicate delivery acknowledged")
        }
        GatewayError::IgnoredEvent(_) => debug!(outcome = %err, "Callback acknowledged without action"),
        GatewayError::UnknownOrder(_) | GatewayError::RejectedEvent(_) => {
            warn!(error = %err, "Callback acknowledged without transition")
        }
        GatewayError::InvalidSignature(_)
        | GatewayError::MalformedPayload(_)
        | GatewayError::Configuration(_) => warn!(error = %err, "Callback rejected"),
        GatewayError::PersistenceFailure(_) | GatewayError::ProviderUnavailable(_) => {
            tracing::error!(error = %err, "Callback failed, provider will redeliver")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryDedupLock;
    use crate::database::{InMemoryOrderStore, NewOrder, OrderStatus, OrderStore};
    use crate::payments::{EventOutcome, ProviderName};
    use crate::services::notifier::NotifyError;
    use crate::services::transition::TransitionConfig;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<NotificationPayload>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn dispatch(
            &self,
            _callback_url: String,
            payload: NotificationPayload,
        ) -> Result<(), NotifyError> {
            self.sent.lock().await.push(payload);
            Ok(())
        }
    }

    async fn pipeline() -> (NotificationPipeline, Arc<InMemoryDedupLock>, Arc<RecordingSink>) {
        let store = Arc::new(InMemoryOrderStore::new());
        store
            .insert_order(NewOrder {
                order_ref: "OUT1".to_string(),
                app_id: "app".to_string(),
                provider: ProviderName::Douyin,
                amount: 1000,
                currency: "CNY".to_string(),
                callback_url: "http://127.0.0.1:1/cb".to_string(),
            })
            .await
            .unwrap();
        let lock = Arc::new(InMemoryDedupLock::new());
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(TransitionEngine::new(store, TransitionConfig::default()));
        (
            NotificationPipeline::new(lock.clone(), engine, sink.clone(), DEFAULT_LOCK_TTL),
            lock,
            sink,
        )
    }

    fn paid() -> VerifiedEvent {
        VerifiedEvent {
            provider: ProviderName::Douyin,
            order_ref: "OUT1".to_string(),
            provider_txn_id: Some("DY1".to_string()),
            settled_amount: Some(1000),
            outcome: EventOutcome::Paid,
            event_time: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_is_already_processed_and_not_renotified() {
        let (pipeline, _, sink) = pipeline().await;

        let t = pipeline.process(paid()).await.unwrap();
        assert_eq!(t.order.status, OrderStatus::Paid);
        assert!(matches!(
            pipeline.process(paid()).await,
            Err(GatewayError::AlreadyProcessed)
        ));
        assert_eq!(sink.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_held_lock_reports_contention() {
        let (pipeline, lock, sink) = pipeline().await;
        let key = LockKey::new(ProviderName::Douyin, "OUT1", crate::payments::EventKind::Payment);
        assert!(lock.acquire(&key, "other", DEFAULT_LOCK_TTL).await.unwrap());

        let err = pipeline.process(paid()).await.unwrap_err();
        assert!(matches!(err, GatewayError::LockContention));
        assert_eq!(err.ack_outcome(), AckOutcome::Accepted);
        assert!(sink.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_processing() {
        let (pipeline, lock, _) = pipeline().await;
        pipeline.process(paid()).await.unwrap();

        let key = LockKey::new(ProviderName::Douyin, "OUT1", crate::payments::EventKind::Payment);
        assert!(lock.acquire(&key, "next", DEFAULT_LOCK_TTL).await.unwrap());
    }
}
