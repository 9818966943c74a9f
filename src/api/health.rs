use axum::{extract::State, Json};
use serde::Serialize;

use super::AppState;
use crate::services::notifier::NotifierMetricsSnapshot;
use crate::workers::SchedulerState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub providers: usize,
    pub reconciliation: SchedulerState,
    pub notifier: NotifierMetricsSnapshot,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        providers: state.registry.len().await,
        reconciliation: state.reconciler.state(),
        notifier: state.notifier_metrics.snapshot(),
    })
}
