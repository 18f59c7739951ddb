//! API endpoint handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::health::HealthStatus;
use crate::models::{DocumentMetadata, Priority, ProcessingOptions, Stage};
use crate::pipeline::PipelineError;
use crate::queue::QueueError;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

/// Error body returned by every endpoint.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::AlreadyRunning | PipelineError::NotRunning => StatusCode::CONFLICT,
            PipelineError::Queue(QueueError::NotFound(_)) => StatusCode::NOT_FOUND,
            PipelineError::Queue(QueueError::NotRetryable(_)) => StatusCode::CONFLICT,
            PipelineError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// Health check endpoint for container orchestration.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.pipeline.get_health_status().await;
    let status = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(health))
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub stage: Option<String>,
}

pub async fn queue_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult {
    let stage = match params.stage.as_deref().filter(|s| !s.is_empty()) {
        Some(name) => Some(
            Stage::from_str(name)
                .ok_or_else(|| ApiError::bad_request(format!("unknown stage: {}", name)))?,
        ),
        None => None,
    };
    let stats = state.pipeline.get_queue_stats(stage).await?;
    Ok(Json(stats).into_response())
}

pub async fn workers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.workers().await)
}

/// Body of a processing request.
#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub options: Option<ProcessingOptions>,
}

pub async fn process_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    Json(request): Json<ProcessRequest>,
) -> ApiResult {
    let priority = match request.priority.as_deref() {
        Some(p) => Priority::from_str(p)
            .ok_or_else(|| ApiError::bad_request(format!("unknown priority: {}", p)))?,
        None => Priority::Medium,
    };

    let receipt = state
        .pipeline
        .start_document_processing(
            &document_id,
            request.metadata,
            priority,
            request.options.unwrap_or_default(),
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

pub async fn dead_letters(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);
    let entries = state.pipeline.dead_letters(limit).await?;
    Ok(Json(entries).into_response())
}

pub async fn retry_dead_letter(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let receipt = state.pipeline.retry_dead_letter(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)).into_response())
}

pub async fn clear_queues(State(state): State<AppState>) -> ApiResult {
    if !state.allow_destructive {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "destructive endpoints are disabled",
        ));
    }
    let deleted = state.pipeline.clear_all_queues().await?;
    Ok(Json(json!({ "deleted": deleted })).into_response())
}
