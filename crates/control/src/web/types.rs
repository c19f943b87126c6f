use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::ValidationFailure;
use serde::Deserialize;
use serde_json::json;

use crate::error::{DispatchError, LeaseError, StoreError};
use crate::plane::ControlPlane;

pub type WebState = Arc<ControlPlane>;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default)]
    pub queue: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(rename = "loop")]
    pub loop_name: Option<String>,
    pub tail: Option<usize>,
}

/// Error body `{ "error": ... }` with a status derived from the failure.
pub struct ApiError(pub StatusCode, pub serde_json::Value);

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, json!({ "error": what.into() }))
    }

    pub fn bad_request(what: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, json!({ "error": what.into() }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::JobNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidTransition { .. } | StoreError::WrongAgent { .. } => StatusCode::CONFLICT,
            StoreError::Io(_) | StoreError::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, json!({ "error": e.to_string() }))
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Validation { job_type, errors } => Self(
                StatusCode::UNPROCESSABLE_ENTITY,
                json!(ValidationFailure { job_type, errors }),
            ),
            DispatchError::Store(e) => e.into(),
        }
    }
}

impl From<LeaseError> for ApiError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::Store(e) => e.into(),
            other => Self(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": other.to_string() })),
        }
    }
}
