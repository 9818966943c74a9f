//! Manual reconciliation trigger

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use super::{json_body, AppState};
use crate::error::AppError;
use crate::workers::{ReconcileRequest, TriggerAck, TriggerSource};

/// POST /api/v1/reconciliation
///
/// Returns as soon as the sweep is scheduled; `accepted: false` when one is
/// already running on this instance.
pub async fn trigger_reconciliation(
    State(state): State<AppState>,
    payload: Result<Json<ReconcileRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TriggerAck>), AppError> {
    let request = json_body(payload)?;
    info!(window_kind = ?request.window_kind, "Manual reconciliation requested");

    let ack = state.reconciler.trigger(request, TriggerSource::Manual)?;
    let status = if ack.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(ack)))
}
