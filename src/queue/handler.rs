//! Job handlers
//!
//! A job carries a serializable [`QueryDef`](crate::store::QueryDef) naming
//! the handler that executes it. Handlers are registered with the queue by
//! name so any orchestrator process sharing the store can pick the job up.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::driver::DriverRegistry;
use crate::error::OrchestratorResult;
use crate::store::QueueJob;

/// Handler name of plain SQL execution
pub const QUERY_HANDLER: &str = "query";

/// Executes the work described by a job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &QueueJob) -> OrchestratorResult<Value>;
}

/// Runs `def.sql` with `def.params` on the job's data source and returns the
/// rows as a JSON array
pub struct QueryHandler {
    drivers: Arc<DriverRegistry>,
}

impl QueryHandler {
    pub fn new(drivers: Arc<DriverRegistry>) -> Self {
        Self { drivers }
    }
}

#[async_trait]
impl JobHandler for QueryHandler {
    async fn execute(&self, job: &QueueJob) -> OrchestratorResult<Value> {
        let driver = self.drivers.get(&job.data_source)?;
        let result = driver.query(&job.def.sql, &job.def.params).await?;
        Ok(result.into_json())
    }
}

/// Handler name to handler
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(name.into(), handler);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().ok()?.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, SqliteDriver};
    use crate::store::QueryDef;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_handler_runs_sql() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        let drivers = Arc::new(
            DriverRegistry::new().with("default", Arc::new(driver) as Arc<dyn Driver>),
        );
        let handler = QueryHandler::new(drivers);

        let job = QueueJob::new(
            "fp",
            "default",
            0,
            QueryDef::sql("SELECT ? + 1 AS n", vec![json!(41)]),
        );
        assert_eq!(handler.execute(&job).await.unwrap(), json!([{"n": 42}]));
    }

    #[tokio::test]
    async fn test_unknown_data_source() {
        let handler = QueryHandler::new(Arc::new(DriverRegistry::new()));
        let job = QueueJob::new("fp", "nowhere", 0, QueryDef::sql("SELECT 1", vec![]));
        assert!(handler.execute(&job).await.is_err());
    }

    #[test]
    fn test_registry() {
        let registry = HandlerRegistry::new();
        registry.register(
            QUERY_HANDLER,
            Arc::new(QueryHandler::new(Arc::new(DriverRegistry::new()))),
        );
        assert!(registry.get(QUERY_HANDLER).is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec![QUERY_HANDLER.to_string()]);
    }
}
