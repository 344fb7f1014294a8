//! Pre-Aggregation Routes
//!
//! - GET /api/v1/pre-aggregations - List registered pre-aggregations
//! - GET /api/v1/pre-aggregations/:name/partitions - Planned partitions and their builds
//! - POST /api/v1/pre-aggregations/:name/refresh - Refresh every partition now
//! - GET /api/v1/pre-aggregations/:name/versions - Build entries, newest first

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{
    PartitionListResponse, PartitionResponse, PreAggregationListResponse, PreAggregationResponse,
    VersionListResponse,
};
use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::preagg::RefreshReport;

/// GET /api/v1/pre-aggregations
pub async fn list_pre_aggregations(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<PreAggregationListResponse>> {
    let definitions = state.orchestrator.scheduler().definitions().await;
    let pre_aggregations: Vec<PreAggregationResponse> =
        definitions.iter().map(PreAggregationResponse::from).collect();

    Ok(Json(PreAggregationListResponse {
        total: pre_aggregations.len(),
        pre_aggregations,
    }))
}

/// GET /api/v1/pre-aggregations/:name/partitions
pub async fn list_partitions(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<PartitionListResponse>> {
    let partitions = state.orchestrator.scheduler().plan(&name).await?;

    Ok(Json(PartitionListResponse {
        pre_aggregation: name,
        partitions: partitions.iter().map(PartitionResponse::from).collect(),
    }))
}

/// POST /api/v1/pre-aggregations/:name/refresh
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<RefreshReport>> {
    tracing::info!(pre_aggregation = %name, "Refresh requested via API");
    let report = state.orchestrator.scheduler().refresh_definition(&name).await?;
    Ok(Json(report))
}

/// GET /api/v1/pre-aggregations/:name/versions
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<VersionListResponse>> {
    let versions = state.orchestrator.scheduler().versions(&name).await?;
    Ok(Json(VersionListResponse {
        pre_aggregation: name,
        versions,
    }))
}
