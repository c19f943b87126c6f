use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use super::types::*;
use crate::audit::AuditEvent;
use crate::metrics::tail_logs;
use crate::query::QuerySnapshot;

pub async fn api_instance_query(
    State(state): State<WebState>,
    Path(instance_id): Path<String>,
    Query(q): Query<SnapshotQuery>,
) -> Result<Json<QuerySnapshot>, ApiError> {
    state
        .query
        .get_snapshot(&instance_id, q.queue, Utc::now())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("instance {instance_id} not found")))
}

pub async fn api_audit(State(state): State<WebState>, Query(q): Query<LimitQuery>) -> Json<Value> {
    let events: Vec<AuditEvent> = state.audit.recent(q.limit.unwrap_or(100)).await;
    let chain_ok = state.audit.verify().await.is_ok();
    Json(json!({ "events": events, "chain_ok": chain_ok }))
}

pub async fn metrics_text(State(state): State<WebState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

pub async fn logs_text(State(state): State<WebState>, Query(q): Query<LogsQuery>) -> String {
    tail_logs(&state.logs, q.loop_name.as_deref(), q.tail.unwrap_or(200)).await
}
