//! Test doubles for the driver contract

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Driver, DriverCapabilities, QueryResult, Row};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Driver that counts executions and answers every query with a counter value.
///
/// Each call returns `[{"n": <call number>}]` after `delay`. The first
/// `transient_failures` calls fail with a transient error.
pub struct ScriptedDriver {
    pub calls: AtomicUsize,
    delay: Duration,
    transient_failures: AtomicUsize,
    fatal: Mutex<Option<String>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            transient_failures: AtomicUsize::new(0),
            fatal: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn transient_failures(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every subsequent call with a non-retryable error
    pub fn fail_with(&self, message: Option<&str>) {
        *self.fatal.lock().unwrap() = message.map(str::to_string);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// SQL text of every executed query, in order
    pub fn executed(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    async fn test_connection(&self) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> OrchestratorResult<QueryResult> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().unwrap().push(sql.to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(OrchestratorError::transient("connection reset"));
        }

        if let Some(message) = self.fatal.lock().unwrap().clone() {
            return Err(OrchestratorError::driver(message));
        }

        let mut row = Row::new();
        row.insert("n".to_string(), json!(n));
        Ok(QueryResult::new(vec!["n".to_string()], vec![row]))
    }
}
