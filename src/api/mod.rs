//! HTTP surface
//!
//! Provider webhooks plus the internal order, refund and reconciliation RPCs.
//! Handlers stay thin; all settlement logic lives in `services`.

pub mod health;
pub mod orders;
pub mod reconciliation;
pub mod webhooks;

use axum::{
    extract::rejection::JsonRejection,
    middleware::from_fn,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::error::AppError;
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::payments::ProviderRegistry;
use crate::services::{NotificationPipeline, NotifierMetrics, OrderService};
use crate::workers::Reconciler;

/// Shared handler dependencies, owned by the service context
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub pipeline: Arc<NotificationPipeline>,
    pub orders: Arc<OrderService>,
    pub reconciler: Arc<Reconciler>,
    pub notifier_metrics: Arc<NotifierMetrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/{provider}/{app_id}", post(webhooks::receive_webhook))
        .route("/api/v1/orders", post(orders::place_order))
        .route("/api/v1/orders/{order_ref}", get(orders::get_order))
        .route(
            "/api/v1/orders/{order_ref}/refunds",
            post(orders::request_refund),
        )
        .route(
            "/api/v1/reconciliation",
            post(reconciliation::trigger_reconciliation),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(from_fn(request_logging_middleware))
        .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
        .with_state(state)
}

/// Unwraps a JSON body, reporting decode failures in the API error format
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}
