//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::config::ApiConfig;
use crate::orchestrator::QueryOrchestrator;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<QueryOrchestrator>,
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<QueryOrchestrator>, config: ApiConfig) -> Self {
        Self {
            orchestrator,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
