//! Order Service
//!
//! Order placement, status lookup and refund requests for internal callers.
//! Placement is a plain insert; every later status change goes through the
//! transition engine.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

use super::transition::TransitionEngine;
use crate::database::{NewOrder, NewRefund, Order, OrderStatus, OrderStore, Refund};
use crate::error::AppError;
use crate::payments::{ProviderName, ProviderRegistry};

// ============================================================================
// Requests / responses
// ============================================================================

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    #[validate(length(min = 1, max = 64))]
    pub order_ref: String,
    pub provider_hint: ProviderName,
    /// Defaults to the provider's lowest registered app id
    #[serde(default)]
    pub app_id: Option<String>,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[serde(rename = "callbackURL", alias = "callbackUrl")]
    #[validate(url)]
    pub callback_url: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    #[validate(length(min = 1, max = 64))]
    pub refund_ref: String,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(max = 256))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub order_ref: String,
    pub provider: ProviderName,
    pub app_id: String,
    pub status: OrderStatus,
    pub amount: i64,
    pub currency: String,
    pub settled_amount: Option<i64>,
    pub provider_txn_id: Option<String>,
    pub needs_review: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub refunds: Vec<Refund>,
}

impl OrderView {
    fn new(order: Order, refunds: Vec<Refund>) -> Self {
        Self {
            order_ref: order.order_ref,
            provider: order.provider,
            app_id: order.app_id,
            status: order.status,
            amount: order.amount,
            currency: order.currency,
            settled_amount: order.settled_amount,
            provider_txn_id: order.provider_txn_id,
            needs_review: order.needs_review,
            refunds,
        }
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct OrderService {
    store: Arc<dyn OrderStore>,
    engine: Arc<TransitionEngine>,
    registry: Arc<ProviderRegistry>,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        engine: Arc<TransitionEngine>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
        }
    }

    #[instrument(skip(self, request), fields(order_ref = %request.order_ref, provider = %request.provider_hint))]
    pub async fn place_order(&self, request: PlaceOrderRequest) -> Result<OrderView, AppError> {
        request
            .validate()
            .map_err(|e| AppError::validation(e.to_string()))?;

        let app_id = match request.app_id {
            Some(app_id) => {
                self.registry.get(request.provider_hint, &app_id).await?;
                app_id
            }
            None => self
                .registry
                .default_app_id(request.provider_hint)
                .await
                .ok_or_else(|| {
                    AppError::from(crate::payments::ProviderError::UnknownProvider(
                        request.provider_hint.to_string(),
                    ))
                })?,
        };

        let order = self
            .store
            .insert_order(NewOrder {
                order_ref: request.order_ref,
                app_id,
                provider: request.provider_hint,
                amount: request.amount,
                currency: request.currency.to_ascii_uppercase(),
                callback_url: request.callback_url,
            })
            .await?;

        info!(amount = order.amount, app_id = %order.app_id, "Order placed");
        Ok(OrderView::new(order, Vec::new()))
    }

    pub async fn order_status(&self, order_ref: &str) -> Result<OrderView, AppError> {
        let order = self
            .store
            .find_order(order_ref)
            .await?
            .ok_or_else(|| AppError::not_found(format!("order {} not found", order_ref)))?;
        let refunds = self.store.list_refunds(order_ref).await?;
        Ok(OrderView::new(order, refunds))
    }

    pub async fn request_refund(
        &self,
        order_ref: &str,
        request: RefundRequest,
    ) -> Result<Refund, AppError> {
        request
            .validate()
            .map_err(|e| AppError::validation(e.to_string()))?;

        let refund = self
            .engine
            .request_refund(NewRefund {
                refund_ref: request.refund_ref,
                order_ref: order_ref.to_string(),
                amount: request.amount,
                reason: request.reason,
            })
            .await?;
        Ok(refund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryOrderStore;
    use crate::error::ErrorCode;
    use crate::payments::ProviderCredentials;
    use crate::services::transition::TransitionConfig;
    use axum::http::StatusCode;

    async fn service() -> OrderService {
        let registry = ProviderRegistry::from_credentials(
            &[ProviderCredentials {
                provider: ProviderName::Huawei,
                app_id: "hw-app".to_string(),
                merchant_id: None,
                base_url: "http://127.0.0.1:9".to_string(),
                signing_secret: "secret".to_string(),
                notify_token: None,
                api_v3_key: None,
                query_timeout_ms: 1_000,
            }],
            reqwest::Client::new(),
        )
        .await
        .unwrap();
        let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
        let engine = Arc::new(TransitionEngine::new(store.clone(), TransitionConfig::default()));
        OrderService::new(store, engine, Arc::new(registry))
    }

    fn request(order_ref: &str) -> PlaceOrderRequest {
        serde_json::from_value(serde_json::json!({
            "orderRef": order_ref,
            "providerHint": "huawei",
            "amount": 1000,
            "currency": "cny",
            "callbackURL": "https://merchant.example.com/notify"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_place_order_uses_default_app_id() {
        let service = service().await;
        let view = service.place_order(request("OUT1")).await.unwrap();
        assert_eq!(view.status, OrderStatus::Pending);
        assert_eq!(view.app_id, "hw-app");
        assert_eq!(view.currency, "CNY");
    }

    #[tokio::test]
    async fn test_duplicate_order_ref_conflicts() {
        let service = service().await;
        service.place_order(request("OUT1")).await.unwrap();
        let err = service.place_order(request("OUT1")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let service = service().await;
        let mut bad = request("OUT1");
        bad.callback_url = "not-a-url".to_string();
        let err = service.place_order(bad).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);

        let mut bad = request("OUT2");
        bad.amount = 0;
        assert!(service.place_order(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_unregistered_provider_is_rejected() {
        let service = service().await;
        let mut other = request("OUT1");
        other.provider_hint = ProviderName::Alipay;
        let err = service.place_order(other).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownProvider);
    }

    #[tokio::test]
    async fn test_refund_on_pending_order_is_not_allowed() {
        let service = service().await;
        service.place_order(request("OUT1")).await.unwrap();
        let err = service
            .request_refund(
                "OUT1",
                RefundRequest {
                    refund_ref: "RF1".to_string(),
                    amount: 100,
                    reason: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RefundNotAllowed);
    }
}
