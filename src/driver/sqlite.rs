//! SQLite driver
//!
//! Executes queries on a SQLite database through rusqlite. Statements run on
//! the blocking pool so a slow query never stalls the async workers.

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags};
use serde_json::{Number, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{quote_ident, Driver, DriverCapabilities, QueryResult, Row};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Driver over one SQLite connection
pub struct SqliteDriver {
    conn: Arc<Mutex<Connection>>,
    read_only: bool,
}

impl SqliteDriver {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> OrchestratorResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(classify)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(classify)?;
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database, mostly for tests and demos
    pub fn open_in_memory() -> OrchestratorResult<Self> {
        Connection::open_in_memory()
            .map(Self::from_connection)
            .map_err(classify)
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            read_only: false,
        }
    }

    /// Builder method: refuse table creation
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Run a batch of statements, e.g. fixtures
    pub fn execute_batch(&self, sql: &str) -> OrchestratorResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql).map_err(classify)
    }

    fn lock(&self) -> OrchestratorResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| OrchestratorError::driver(format!("Connection lock poisoned: {}", e)))
    }

    async fn blocking<T, F>(&self, f: F) -> OrchestratorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> OrchestratorResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                OrchestratorError::driver(format!("Connection lock poisoned: {}", e))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| OrchestratorError::driver(format!("Query task failed: {}", e)))?
    }
}

/// Busy and locked databases are worth retrying, everything else is not
fn classify(err: rusqlite::Error) -> OrchestratorError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            OrchestratorError::transient(err.to_string())
        }
        _ => OrchestratorError::driver(err.to_string()),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|byte| format!("{:02x}", byte)).collect()),
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> OrchestratorResult<QueryResult> {
    let mut stmt = conn.prepare(sql).map_err(classify)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt
        .query(params_from_iter(params.iter().map(to_sql)))
        .map_err(classify)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(classify)? {
        let mut record = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(classify)?;
            record.insert(column.clone(), from_sql(value));
        }
        out.push(record);
    }

    Ok(QueryResult::new(columns, out))
}

#[async_trait]
impl Driver for SqliteDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            streaming: false,
            read_only: self.read_only,
            can_create_table: !self.read_only,
        }
    }

    async fn test_connection(&self) -> OrchestratorResult<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> OrchestratorResult<QueryResult> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.blocking(move |conn| run_query(conn, &sql, &params)).await
    }

    async fn upload_table(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> OrchestratorResult<()> {
        if self.read_only {
            return Err(OrchestratorError::driver(format!(
                "Read-only data source cannot create {}",
                table
            )));
        }
        if columns.is_empty() {
            return Err(OrchestratorError::driver(format!(
                "Cannot create {} without columns",
                table
            )));
        }

        let table = quote_ident(table);
        let columns = columns.to_vec();
        let rows = rows.to_vec();

        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(classify)?;
            let column_list = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            tx.execute(&format!("CREATE TABLE {} ({})", table, column_list), [])
                .map_err(classify)?;
            {
                let placeholders = vec!["?"; columns.len()].join(", ");
                let mut stmt = tx
                    .prepare(&format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        table, column_list, placeholders
                    ))
                    .map_err(classify)?;
                for row in &rows {
                    let values = columns
                        .iter()
                        .map(|c| to_sql(row.get(c).unwrap_or(&Value::Null)));
                    stmt.execute(params_from_iter(values)).map_err(classify)?;
                }
            }
            tx.commit().map_err(classify)
        })
        .await
    }
}
