//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::OrchestratorError;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body returned by every failing handler
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps orchestrator errors onto status codes
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidState(_) => StatusCode::CONFLICT,
        OrchestratorError::Connectivity(_) | OrchestratorError::SshError(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "optimizerd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Trigger request
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub template_id: String,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

/// Queue a job; the response does not wait for provisioning
pub async fn create_job_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let template_name = request
        .template_name
        .unwrap_or_else(|| request.template_id.clone());
    let triggered_by = request.triggered_by.unwrap_or_default();

    let snapshot = state
        .manager
        .trigger_optimization(&request.template_id, &template_name, &triggered_by)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

pub async fn list_jobs_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.manager.list_jobs().await)
}

pub async fn get_job_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.get_job(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub lines: Option<usize>,
}

pub async fn job_log_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.get_remote_log(&id, query.lines).await?))
}

pub async fn stop_job_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.stop_optimization(&id).await?))
}
