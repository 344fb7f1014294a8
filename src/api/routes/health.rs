//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes liveness and readiness checks.
//!
//! - GET /health/live - Liveness check (process is alive)
//! - GET /health/ready - Readiness check (store reachable)
//! - GET /health - Full health status with every data source

use axum::{extract::State, http::StatusCode, Json};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;

/// GET /health/live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// Ready once the cache/queue store answers.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    if check_store_health(&state).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store_ok = check_store_health(&state).await;

    let drivers = state.orchestrator.drivers();
    let mut data_sources = BTreeMap::new();
    for name in drivers.data_sources() {
        let status = match drivers.get(&name) {
            Ok(driver) => match driver.test_connection().await {
                Ok(()) => "ok".to_string(),
                Err(e) => {
                    tracing::warn!(
                        data_source = %name,
                        error = %e,
                        "Data source health check failed"
                    );
                    "error".to_string()
                }
            },
            Err(_) => "error".to_string(),
        };
        data_sources.insert(name, status);
    }

    let sources_ok = data_sources.values().all(|s| s == "ok");
    let status = match (store_ok, sources_ok) {
        (true, true) => "healthy",
        (true, false) => "degraded",
        (false, _) => "unhealthy",
    };

    Json(HealthResponse {
        status: status.to_string(),
        store: if store_ok { "ok" } else { "error" }.to_string(),
        store_backend: state.orchestrator.store().backend().to_string(),
        data_sources,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn check_store_health(state: &AppState) -> bool {
    match state.orchestrator.store().list_jobs(None).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            false
        }
    }
}
