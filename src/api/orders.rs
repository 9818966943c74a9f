//! Order placement, status and refund RPCs

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};

use super::{json_body, AppState};
use crate::database::Refund;
use crate::error::AppError;
use crate::services::{OrderView, PlaceOrderRequest, RefundRequest};

/// POST /api/v1/orders
pub async fn place_order(
    State(state): State<AppState>,
    payload: Result<Json<PlaceOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OrderView>), AppError> {
    let request = json_body(payload)?;
    let order = state.orders.place_order(request).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /api/v1/orders/{order_ref}
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
) -> Result<Json<OrderView>, AppError> {
    Ok(Json(state.orders.order_status(&order_ref).await?))
}

/// POST /api/v1/orders/{order_ref}/refunds
pub async fn request_refund(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
    payload: Result<Json<RefundRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Refund>), AppError> {
    let request = json_body(payload)?;
    let refund = state.orders.request_refund(&order_ref, request).await?;
    Ok((StatusCode::CREATED, Json(refund)))
}
