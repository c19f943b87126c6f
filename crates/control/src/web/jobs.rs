use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use common::{ClaimRequest, DispatchRequest, Job, JobStatus, ResultReport};
use serde_json::{json, Value};

use super::types::*;

pub async fn api_agent_jobs(
    State(state): State<WebState>,
    Path(agent_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Json<Vec<Job>> {
    Json(state.leases.queued(&agent_id, q.limit.unwrap_or(20)).await)
}

pub async fn api_agent_claim(
    State(state): State<WebState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Option<Job>>, ApiError> {
    Ok(Json(state.leases.claim_next(&agent_id, Utc::now()).await?))
}

pub async fn api_job_claim(
    State(state): State<WebState>,
    Path(job_id): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.leases.claim(&job_id, &req.agent_id, Utc::now()).await?))
}

pub async fn api_job_result(
    State(state): State<WebState>,
    Path(job_id): Path<String>,
    Json(report): Json<ResultReport>,
) -> Result<Json<Value>, ApiError> {
    let receipt = state.leases.report(&job_id, report, Utc::now()).await?;
    Ok(Json(json!({
        "job": receipt.job,
        "outcome": format!("{:?}", receipt.outcome),
        "applied": receipt.applied.map(|a| format!("{a:?}")),
    })))
}

pub async fn api_jobs_dispatch(
    State(state): State<WebState>,
    Json(req): Json<DispatchRequest>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.dispatcher.dispatch(&req.agent_id, &req.job_type, req.payload, Utc::now()).await?))
}

pub async fn api_jobs_list(
    State(state): State<WebState>,
    Query(q): Query<JobListQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let status = match q.status.as_deref() {
        Some(s) => Some(s.parse::<JobStatus>().map_err(|e| ApiError::bad_request(e.to_string()))?),
        None => None,
    };
    Ok(Json(state.store.list(status, q.limit.unwrap_or(50)).await))
}

pub async fn api_jobs_get(State(state): State<WebState>, Path(job_id): Path<String>) -> Result<Json<Job>, ApiError> {
    state
        .store
        .get(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))
}

pub async fn api_jobs_cancel(
    State(state): State<WebState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state.dispatcher.cancel(&job_id, Utc::now()).await?;
    Ok(Json(json!({ "job_id": job_id, "cancelled": cancelled })))
}
