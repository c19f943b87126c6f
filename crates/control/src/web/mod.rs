//! Agent-facing and operator-facing HTTP API.

mod jobs;
mod ops;
mod types;

pub use jobs::*;
pub use ops::*;
pub use types::*;

use std::future::Future;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;

pub fn create_app(state: WebState) -> Router {
    Router::new()
        // agents
        .route("/api/agents/:agent_id/jobs", get(api_agent_jobs))
        .route("/api/agents/:agent_id/claim", post(api_agent_claim))
        .route("/api/jobs/:job_id/claim", post(api_job_claim))
        .route("/api/jobs/:job_id/result", post(api_job_result))
        // operators
        .route("/api/jobs", get(api_jobs_list).post(api_jobs_dispatch))
        .route("/api/jobs/:job_id", get(api_jobs_get))
        .route("/api/jobs/:job_id/cancel", post(api_jobs_cancel))
        .route("/api/instances/:instance_id/query", get(api_instance_query))
        .route("/api/audit", get(api_audit))
        .route("/metrics", get(metrics_text))
        .route("/logs", get(logs_text))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// Serve the API on `config.bind` until `shutdown` resolves.
pub async fn serve(state: WebState, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let bind = state.config.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "control plane API listening");
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
