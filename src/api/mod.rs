//! Conductor admin API
//!
//! HTTP API layer over the orchestrator, built with Axum.
//!
//! # Endpoints
//!
//! ## Load
//! - `POST /api/v1/load` - Answer a query (200 with rows, 202 to continue waiting)
//!
//! ## Queue
//! - `GET /api/v1/queue` - List live jobs
//! - `GET /api/v1/queue/:fingerprint` - Stage of a live job
//! - `DELETE /api/v1/queue/:fingerprint` - Cancel a live job
//! - `POST /api/v1/queue/maintenance` - Run a maintenance pass
//!
//! ## Pre-aggregations
//! - `GET /api/v1/pre-aggregations` - List definitions
//! - `GET /api/v1/pre-aggregations/:name/partitions` - Planned partitions
//! - `POST /api/v1/pre-aggregations/:name/refresh` - Refresh now
//! - `GET /api/v1/pre-aggregations/:name/versions` - Build entries
//!
//! ## Health
//! - `GET /health/live` - Liveness check
//! - `GET /health/ready` - Readiness check
//! - `GET /health` - Full health status

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ApiConfig;

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/load", post(routes::load::load))
        .route("/queue", get(routes::queue::list_jobs))
        .route("/queue/maintenance", post(routes::queue::run_maintenance))
        .route(
            "/queue/:fingerprint",
            get(routes::queue::query_stage).delete(routes::queue::cancel_job),
        )
        .route(
            "/pre-aggregations",
            get(routes::pre_aggregations::list_pre_aggregations),
        )
        .route(
            "/pre-aggregations/:name/partitions",
            get(routes::pre_aggregations::list_partitions),
        )
        .route(
            "/pre-aggregations/:name/refresh",
            post(routes::pre_aggregations::refresh),
        )
        .route(
            "/pre-aggregations/:name/versions",
            get(routes::pre_aggregations::list_versions),
        );

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let cors = cors_layer(&state.config);
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared_state)
}

/// Permissive unless origins are configured
fn cors_layer(config: &ApiConfig) -> CorsLayer {
    if config.cors_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(origins))
}

/// Start the API server
pub async fn serve(state: AppState) -> Result<(), ApiError> {
    let addr = state.config.addr();
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Conductor API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Conductor API shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::dto::{HealthResponse, QueueListResponse, VersionListResponse};
    use crate::api::error::ErrorResponse;
    use crate::driver::testing::ScriptedDriver;
    use crate::driver::{Driver, DriverRegistry};
    use crate::orchestrator::{LoadRequest, QueryOrchestrator};
    use crate::preagg::scheduler::tests::{orders_definition, source};
    use crate::preagg::{RefreshReport, SchedulerConfig};
    use crate::queue::QueueConfig;
    use crate::store::MemoryStore;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn create_test_app(driver: Arc<dyn Driver>) -> (Router, Arc<QueryOrchestrator>) {
        let queue_config = QueueConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let orchestrator = Arc::new(QueryOrchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DriverRegistry::new().with("default", driver)),
            queue_config,
            SchedulerConfig::default(),
        ));
        let state = AppState::new(Arc::clone(&orchestrator), ApiConfig::default());
        (build_router(state), orchestrator)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn send(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body<T: DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (app, _) = create_test_app(source());

        let response = app.clone().oneshot(get("/health/live")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/health/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = json_body(response).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.store_backend, "memory");
        assert_eq!(health.data_sources.get("default").map(String::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn test_load() {
        let (app, _) = create_test_app(source());

        let request = json!({"sql": "SELECT COUNT(*) AS n FROM orders"});
        let response = app
            .clone()
            .oneshot(send("POST", "/api/v1/load", request.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = json_body(response).await;
        assert_eq!(body["status"], "data");
        assert_eq!(body["data"], json!([{"n": 7}]));
        assert_eq!(body["from_cache"], false);

        let response = app.oneshot(send("POST", "/api/v1/load", request)).await.unwrap();
        let body: Value = json_body(response).await;
        assert_eq!(body["from_cache"], true);
    }

    #[tokio::test]
    async fn test_load_errors() {
        let (app, _) = create_test_app(source());

        let response = app
            .clone()
            .oneshot(send("POST", "/api/v1/load", json!({"sql": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(send(
                "POST",
                "/api/v1/load",
                json!({"sql": "SELECT 1", "data_source": "missing"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = json_body(response).await;
        assert_eq!(body.error.code, "INVALID_REQUEST");

        let response = app
            .oneshot(send("POST", "/api/v1/load", json!({"sql": "SELECT * FROM nowhere"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_load_continue_wait() {
        let driver = Arc::new(ScriptedDriver::new().delay(Duration::from_millis(300)));
        let (app, _) = create_test_app(driver);

        let request = json!({
            "sql": "SELECT n FROM slow",
            "policy": {"continue_wait_timeout_ms": 20}
        });
        let response = app.oneshot(send("POST", "/api/v1/load", request)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: Value = json_body(response).await;
        assert_eq!(body, json!({"status": "continue_wait"}));
    }

    #[tokio::test]
    async fn test_queue_inspection_and_cancel() {
        let driver = Arc::new(ScriptedDriver::new().delay(Duration::from_millis(500)));
        let (app, orchestrator) = create_test_app(driver);

        let request = LoadRequest::new("SELECT n FROM slow");
        let fingerprint = orchestrator.fingerprint(&request).await.unwrap();
        let waiter = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.load(request).await }
        });

        let mut listed = QueueListResponse { jobs: vec![], total: 0 };
        for _ in 0..50 {
            let response = app.clone().oneshot(get("/api/v1/queue")).await.unwrap();
            listed = json_body(response).await;
            if listed.total > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(listed.total, 1);
        assert_eq!(listed.jobs[0].fingerprint, fingerprint.as_str());

        let uri = format!("/api/v1/queue/{}", fingerprint);
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stage: Value = json_body(response).await;
        assert_eq!(stage["stage"], "executing");

        let response = app
            .clone()
            .oneshot(Request::builder().method("DELETE").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        assert!(waiter.await.unwrap().is_err());
        let response = app.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pre_aggregation_routes() {
        let (app, orchestrator) = create_test_app(source());
        orchestrator.scheduler().register(orders_definition()).await.unwrap();

        let response = app.clone().oneshot(get("/api/v1/pre-aggregations")).await.unwrap();
        let body: Value = json_body(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["pre_aggregations"][0]["granularity"], "month");

        let response = app
            .clone()
            .oneshot(send("POST", "/api/v1/pre-aggregations/orders_monthly/refresh", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: RefreshReport = json_body(response).await;
        assert_eq!(report.refreshed.len(), 3);

        let response = app
            .clone()
            .oneshot(get("/api/v1/pre-aggregations/orders_monthly/versions"))
            .await
            .unwrap();
        let versions: VersionListResponse = json_body(response).await;
        assert_eq!(versions.versions.len(), 3);

        let response = app
            .clone()
            .oneshot(get("/api/v1/pre-aggregations/orders_monthly/partitions"))
            .await
            .unwrap();
        let body: Value = json_body(response).await;
        assert_eq!(body["partitions"][0]["table_name"], "orders_rollup20200101");
        assert_eq!(body["partitions"][0]["immutable"], true);
        assert!(body["partitions"][2]["target_table"].is_string());

        let response = app
            .oneshot(send("POST", "/api/v1/pre-aggregations/unknown/refresh", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
