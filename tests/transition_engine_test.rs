//! Integration tests for the order transition engine
//!
//! Tests cover:
//! - Re-applying an event changes nothing
//! - Terminal states are never left for another payment state
//! - Concurrent application of the same event succeeds exactly once
//! - Refund totals never exceed the settled amount
//! - Refund references are unique across orders

mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use std::sync::Arc;

    use paygate::database::{InMemoryOrderStore, NewRefund, OrderStatus, OrderStore, StoreError};
    use paygate::payments::{EventOutcome, ProviderName, RefundOutcome, VerifiedEvent};
    use paygate::services::{TransitionConfig, TransitionEngine, TransitionError};

    fn engine(store: Arc<InMemoryOrderStore>) -> TransitionEngine {
        TransitionEngine::new(store, TransitionConfig::default())
    }

    fn failed_event(provider: ProviderName, order_ref: &str) -> VerifiedEvent {
        VerifiedEvent {
            provider,
            order_ref: order_ref.to_string(),
            provider_txn_id: None,
            settled_amount: None,
            outcome: EventOutcome::PaymentFailed {
                reason: Some("USER_CANCEL".to_string()),
            },
            event_time: None,
        }
    }

    fn refund_event(order_ref: &str, refund_ref: &str, succeeded: bool) -> VerifiedEvent {
        VerifiedEvent {
            provider: ProviderName::Alipay,
            order_ref: order_ref.to_string(),
            provider_txn_id: None,
            settled_amount: None,
            outcome: EventOutcome::Refund(RefundOutcome {
                refund_ref: refund_ref.to_string(),
                provider_refund_id: None,
                succeeded,
            }),
            event_time: None,
        }
    }

    fn refund(order_ref: &str, refund_ref: &str, amount: i64) -> NewRefund {
        NewRefund {
            refund_ref: refund_ref.to_string(),
            order_ref: order_ref.to_string(),
            amount,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_reapplying_an_event_is_a_no_op() {
        let store = Arc::new(InMemoryOrderStore::new());
        seed_order(&store, "OUT1", ProviderName::Alipay, 1000).await;
        let engine = engine(store.clone());
        let event = paid_event(ProviderName::Alipay, "OUT1", 1000);

        let first = engine.apply("OUT1", &event).await.unwrap();
        assert!(first.applied);
        let after_first = store.find_order("OUT1").await.unwrap().unwrap();

        let second = engine.apply("OUT1", &event).await.unwrap();
        assert!(!second.applied);
        let after_second = store.find_order("OUT1").await.unwrap().unwrap();

        assert_eq!(after_first.status, after_second.status);
        assert_eq!(after_first.settled_amount, after_second.settled_amount);
        assert_eq!(after_first.updated_at, after_second.updated_at);
    }

    #[tokio::test]
    async fn test_terminal_payment_states_are_final() {
        let store = Arc::new(InMemoryOrderStore::new());
        seed_order(&store, "PAID", ProviderName::Wechat, 100).await;
        seed_order(&store, "FAILED", ProviderName::Wechat, 100).await;
        let engine = engine(store.clone());

        engine
            .apply("PAID", &paid_event(ProviderName::Wechat, "PAID", 100))
            .await
            .unwrap();
        let late_failure = engine
            .apply("PAID", &failed_event(ProviderName::Wechat, "PAID"))
            .await
            .unwrap();
        assert!(!late_failure.applied);
        assert_eq!(late_failure.order.status, OrderStatus::Paid);

        engine
            .apply("FAILED", &failed_event(ProviderName::Wechat, "FAILED"))
            .await
            .unwrap();
        let late_success = engine
            .apply("FAILED", &paid_event(ProviderName::Wechat, "FAILED", 100))
            .await
            .unwrap();
        assert!(!late_success.applied);
        assert_eq!(
            store.find_order("FAILED").await.unwrap().unwrap().status,
            OrderStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_concurrent_application_succeeds_once() {
        let store = Arc::new(InMemoryOrderStore::new());
        seed_order(&store, "RACE", ProviderName::Douyin, 700).await;
        let engine = Arc::new(engine(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .apply("RACE", &paid_event(ProviderName::Douyin, "RACE", 700))
                    .await
                    .unwrap()
                    .applied
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_missing_amount_settles_requested_amount() {
        let store = Arc::new(InMemoryOrderStore::new());
        seed_order(&store, "OUT2", ProviderName::Huawei, 450).await;
        let engine = engine(store);

        let mut event = paid_event(ProviderName::Huawei, "OUT2", 0);
        event.settled_amount = None;
        let transition = engine.apply("OUT2", &event).await.unwrap();

        assert_eq!(transition.order.settled_amount, Some(450));
        assert!(!transition.needs_review);
    }

    #[tokio::test]
    async fn test_partial_refunds_never_exceed_settled_amount() {
        let store = Arc::new(InMemoryOrderStore::new());
        seed_order(&store, "OUT3", ProviderName::Alipay, 1000).await;
        let engine = engine(store.clone());
        engine
            .apply("OUT3", &paid_event(ProviderName::Alipay, "OUT3", 1000))
            .await
            .unwrap();

        engine.request_refund(refund("OUT3", "RF1", 600)).await.unwrap();
        let too_much = engine.request_refund(refund("OUT3", "RF2", 500)).await;
        assert!(matches!(
            too_much,
            Err(TransitionError::RefundExceedsSettled { available: 400, requested: 500, .. })
        ));

        let partial = engine
            .apply("OUT3", &refund_event("OUT3", "RF1", true))
            .await
            .unwrap();
        assert!(partial.applied);
        assert_eq!(partial.order.status, OrderStatus::Refunding);

        engine.request_refund(refund("OUT3", "RF3", 400)).await.unwrap();
        let rest = engine
            .apply("OUT3", &refund_event("OUT3", "RF3", true))
            .await
            .unwrap();
        assert_eq!(rest.order.status, OrderStatus::Refunded);

        let refunded: i64 = store
            .list_refunds("OUT3")
            .await
            .unwrap()
            .iter()
            .filter(|r| r.status == paygate::database::RefundStatus::Succeeded)
            .map(|r| r.amount)
            .sum();
        assert_eq!(refunded, 1000);
    }

    #[tokio::test]
    async fn test_failed_refund_leaves_order_refunding() {
        let store = Arc::new(InMemoryOrderStore::new());
        seed_order(&store, "OUT4", ProviderName::Alipay, 1000).await;
        let engine = engine(store.clone());
        engine
            .apply("OUT4", &paid_event(ProviderName::Alipay, "OUT4", 1000))
            .await
            .unwrap();
        engine.request_refund(refund("OUT4", "RF4", 1000)).await.unwrap();

        let failed = engine
            .apply("OUT4", &refund_event("OUT4", "RF4", false))
            .await
            .unwrap();
        assert!(failed.applied);
        assert_eq!(failed.order.status, OrderStatus::Refunding);

        // A later success for an already failed refund does not apply
        let late = engine
            .apply("OUT4", &refund_event("OUT4", "RF4", true))
            .await
            .unwrap();
        assert!(!late.applied);
    }

    #[tokio::test]
    async fn test_refund_for_unknown_reference_is_rejected() {
        let store = Arc::new(InMemoryOrderStore::new());
        seed_order(&store, "OUT5", ProviderName::Alipay, 100).await;
        let engine = engine(store);
        engine
            .apply("OUT5", &paid_event(ProviderName::Alipay, "OUT5", 100))
            .await
            .unwrap();

        let result = engine.apply("OUT5", &refund_event("OUT5", "NOPE", true)).await;
        assert!(matches!(result, Err(TransitionError::RefundNotFound(_))));
    }

    #[tokio::test]
    async fn test_refund_reference_reused_on_another_order_is_duplicate() {
        let store = Arc::new(InMemoryOrderStore::new());
        seed_order(&store, "OUT6", ProviderName::Alipay, 1000).await;
        seed_order(&store, "OUT7", ProviderName::Alipay, 1000).await;
        let engine = engine(store.clone());
        for order_ref in ["OUT6", "OUT7"] {
            engine
                .apply(order_ref, &paid_event(ProviderName::Alipay, order_ref, 1000))
                .await
                .unwrap();
        }

        engine.request_refund(refund("OUT6", "RF-SHARED", 300)).await.unwrap();
        let reused = engine.request_refund(refund("OUT7", "RF-SHARED", 300)).await;
        assert!(matches!(
            reused,
            Err(TransitionError::Persistence(StoreError::Duplicate { ref key })) if key == "RF-SHARED"
        ));

        // The second order is untouched
        let other = store.find_order("OUT7").await.unwrap().unwrap();
        assert_eq!(other.status, OrderStatus::Paid);
        assert!(store.list_refunds("OUT7").await.unwrap().is_empty());

        // Replaying on the owning order is still idempotent
        let replay = engine.request_refund(refund("OUT6", "RF-SHARED", 300)).await.unwrap();
        assert_eq!(replay.order_ref, "OUT6");
    }
}
