//! Data-source drivers
//!
//! The uniform execution contract the queue calls into. A driver wraps one
//! database client and exposes `query`/`stream`, plus a capability descriptor
//! the pre-aggregation builder uses to choose between building a table in the
//! source and downloading rows for upload elsewhere.
//!
//! [`SqliteDriver`] is the bundled adapter. Other databases plug in by
//! implementing [`Driver`] and registering it in the [`DriverRegistry`].

pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use sqlite::SqliteDriver;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{OrchestratorError, OrchestratorResult};

/// One result row, keyed by column name
pub type Row = Map<String, Value>;

/// What a driver can do beyond plain queries
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Rows can be streamed without buffering the full result
    pub streaming: bool,
    /// The connection must not be written to
    pub read_only: bool,
    /// `CREATE TABLE ... AS SELECT` and `upload_table` are available
    pub can_create_table: bool,
}

/// A fully buffered query result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as a JSON array, the shape cached and returned to callers
    pub fn into_json(self) -> Value {
        Value::Array(self.rows.into_iter().map(Value::Object).collect())
    }

    /// First column of the first row, for scalar queries
    pub fn scalar(&self) -> Option<&Value> {
        let column = self.columns.first()?;
        self.rows.first()?.get(column)
    }
}

/// A streamed query result
pub struct RowStream {
    pub columns: Vec<String>,
    pub rows: BoxStream<'static, OrchestratorResult<Row>>,
}

impl RowStream {
    /// Drain the stream into a buffered result
    pub async fn collect(mut self) -> OrchestratorResult<QueryResult> {
        let mut rows = Vec::new();
        while let Some(row) = self.rows.next().await {
            rows.push(row?);
        }
        Ok(QueryResult::new(self.columns, rows))
    }
}

/// Uniform execution contract of a data source
#[async_trait]
pub trait Driver: Send + Sync {
    fn capabilities(&self) -> DriverCapabilities;

    async fn test_connection(&self) -> OrchestratorResult<()>;

    async fn query(&self, sql: &str, params: &[Value]) -> OrchestratorResult<QueryResult>;

    /// Stream rows. Drivers without native streaming buffer the result.
    async fn stream(&self, sql: &str, params: &[Value]) -> OrchestratorResult<RowStream> {
        let result = self.query(sql, params).await?;
        Ok(RowStream {
            columns: result.columns,
            rows: stream::iter(result.rows.into_iter().map(Ok)).boxed(),
        })
    }

    /// Create `table` with `columns` and insert `rows`
    async fn upload_table(
        &self,
        table: &str,
        _columns: &[String],
        _rows: &[Row],
    ) -> OrchestratorResult<()> {
        Err(OrchestratorError::driver(format!(
            "Driver cannot create table {}",
            table
        )))
    }

    async fn drop_table(&self, table: &str) -> OrchestratorResult<()> {
        self.query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), &[])
            .await
            .map(|_| ())
    }

    /// Release pooled connections
    async fn release(&self) -> OrchestratorResult<()> {
        Ok(())
    }
}

/// Quote an identifier with double quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Data source name to driver
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: register a driver
    pub fn with(self, data_source: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.register(data_source, driver);
        self
    }

    pub fn register(&self, data_source: impl Into<String>, driver: Arc<dyn Driver>) {
        if let Ok(mut drivers) = self.drivers.write() {
            drivers.insert(data_source.into(), driver);
        }
    }

    pub fn get(&self, data_source: &str) -> OrchestratorResult<Arc<dyn Driver>> {
        self.drivers
            .read()
            .ok()
            .and_then(|drivers| drivers.get(data_source).cloned())
            .ok_or_else(|| {
                OrchestratorError::InvalidRequest(format!("Unknown data source: {}", data_source))
            })
    }

    pub fn data_sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .drivers
            .read()
            .map(|drivers| drivers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Release every registered driver, logging failures
    pub async fn release_all(&self) {
        let drivers: Vec<(String, Arc<dyn Driver>)> = self
            .drivers
            .read()
            .map(|d| d.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        for (name, driver) in drivers {
            if let Err(e) = driver.release().await {
                tracing::warn!(data_source = %name, error = %e, "Failed to release driver");
            }
        }
    }
}
