//! Load Route
//!
//! - POST /api/v1/load - Answer a compiled query through the cache and queue
//!
//! Returns 200 with the rows, or 202 with `{"status": "continue_wait"}` while
//! the query is still running. Clients poll by sending the same body again.

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::orchestrator::{LoadRequest, LoadResponse};

/// POST /api/v1/load
pub async fn load(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoadRequest>,
) -> ApiResult<(StatusCode, Json<LoadResponse>)> {
    if request.sql.trim().is_empty() {
        return Err(ApiError::Validation("sql must not be empty".to_string()));
    }

    let response = state.orchestrator.load(request).await?;
    let status = if response.is_continue_wait() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}
