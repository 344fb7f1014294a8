//! Queue Routes
//!
//! Inspection and cancellation of live queue jobs.
//!
//! - GET /api/v1/queue - List live jobs, optionally for one data source
//! - GET /api/v1/queue/:fingerprint - Stage of the live job for a fingerprint
//! - DELETE /api/v1/queue/:fingerprint - Cancel the live job for a fingerprint
//! - POST /api/v1/queue/maintenance - Run one stall/orphan maintenance pass

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::dto::{QueryStageResponse, QueueJobResponse, QueueListParams, QueueListResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::queue::{MaintenanceReport, QueryFingerprint};

/// GET /api/v1/queue
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueueListParams>,
) -> ApiResult<Json<QueueListResponse>> {
    let jobs = state
        .orchestrator
        .queue()
        .jobs(params.data_source.as_deref())
        .await?;

    let jobs: Vec<QueueJobResponse> = jobs.iter().map(QueueJobResponse::from).collect();
    Ok(Json(QueueListResponse {
        total: jobs.len(),
        jobs,
    }))
}

/// GET /api/v1/queue/:fingerprint
pub async fn query_stage(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> ApiResult<Json<QueryStageResponse>> {
    let stage = state
        .orchestrator
        .queue()
        .query_stage(&QueryFingerprint::from_hex(fingerprint.as_str()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No live job for {}", fingerprint)))?;

    Ok(Json(QueryStageResponse {
        description: stage.to_string(),
        fingerprint,
        stage,
    }))
}

/// DELETE /api/v1/queue/:fingerprint
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> ApiResult<StatusCode> {
    let cancelled = state
        .orchestrator
        .queue()
        .cancel(&QueryFingerprint::from_hex(fingerprint.as_str()))
        .await?;

    if cancelled {
        tracing::info!(fingerprint = %fingerprint, "Cancelled job via API");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("No live job for {}", fingerprint)))
    }
}

/// POST /api/v1/queue/maintenance
pub async fn run_maintenance(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<MaintenanceReport>> {
    let report = state.orchestrator.queue().run_maintenance().await?;
    Ok(Json(report))
}
