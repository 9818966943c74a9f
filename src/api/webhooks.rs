//! Provider webhook endpoint
//!
//! `POST /webhooks/{provider}/{app_id}`. The body is passed through untouched;
//! the adapter decides how to read it and how to acknowledge it.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::AppState;
use crate::error::AppError;
use crate::logging::mask_reference;
use crate::payments::{ProviderAck, ProviderName, RawCallback};

pub async fn receive_webhook(
    State(state): State<AppState>,
    Path((provider, app_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provider_name = match provider.parse::<ProviderName>() {
        Ok(name) => name,
        Err(e) => {
            warn!(provider = %provider, "Webhook for unknown provider");
            return AppError::from(e).into_response();
        }
    };

    let adapter = match state.registry.get(provider_name, &app_id).await {
        Ok(adapter) => adapter,
        Err(e) => {
            warn!(provider = %provider_name, app_id = %mask_reference(&app_id), "Webhook for unregistered app");
            return AppError::from(e).into_response();
        }
    };

    let callback = RawCallback::new(headers, body.to_vec());
    let ack = state.pipeline.ingest(adapter.as_ref(), &callback).await;
    ack_response(ack)
}

fn ack_response(ack: ProviderAck) -> Response {
    let status = StatusCode::from_u16(ack.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, ack.content_type)], ack.body).into_response()
}
