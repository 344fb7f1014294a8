//! SQLite store backend
//!
//! A database file several orchestrator processes can share. Every queue
//! transition reads and writes inside one `BEGIN IMMEDIATE` transaction, which
//! takes SQLite's write lock up front: two processes calling `claim_next_job`
//! concurrently are serialized, so the active-count check and the claim are a
//! single atomic step.
//!
//! Jobs are stored as a JSON body plus the columns the queue filters and
//! orders on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::types::*;
use super::{StoreDriver, StoreError, StoreResult};
use crate::error::OrchestratorError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER
    );
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        data_source TEXT NOT NULL,
        priority INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        status TEXT NOT NULL,
        heartbeat_at INTEGER,
        touched_at INTEGER NOT NULL,
        persistent INTEGER NOT NULL,
        finished_at INTEGER,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_dequeue ON jobs(data_source, status, priority DESC, seq);
    CREATE INDEX IF NOT EXISTS idx_jobs_fingerprint ON jobs(fingerprint, status);
    CREATE TABLE IF NOT EXISTS versions (
        target_table_name TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        last_updated_at INTEGER NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_versions_table ON versions(table_name);
";

const LIVE_STATUSES: &str = "('queued', 'active', 'stalled')";

/// Store backend on a SQLite database file. Statements run on the blocking
/// pool, so a busy database never stalls the runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Create or open the store database
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Path to the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run `f` inside an immediate transaction, committing on success
    async fn write_tx<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>) -> StoreResult<T> + Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn decode_job(body: String) -> StoreResult<QueueJob> {
    Ok(serde_json::from_str(&body)?)
}

fn load_job(conn: &Connection, id: Uuid) -> StoreResult<Option<QueueJob>> {
    let body: Option<String> = conn
        .prepare_cached("SELECT body FROM jobs WHERE id = ?1")?
        .query_row(params![id.to_string()], |row| row.get(0))
        .optional()?;
    body.map(decode_job).transpose()
}

fn load_jobs(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> StoreResult<Vec<QueueJob>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let bodies = stmt
        .query_map(args, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    bodies.into_iter().map(decode_job).collect()
}

fn save_job(conn: &Connection, job: &QueueJob) -> StoreResult<()> {
    let heartbeat_at = match &job.state {
        JobState::Active { heartbeat_at, .. } => Some(millis(*heartbeat_at)),
        _ => None,
    };
    conn.prepare_cached(
        "INSERT OR REPLACE INTO jobs
            (id, fingerprint, data_source, priority, seq, status, heartbeat_at,
             touched_at, persistent, finished_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?
    .execute(params![
        job.id.to_string(),
        job.fingerprint,
        job.data_source,
        job.priority,
        job.seq as i64,
        job.status().as_str(),
        heartbeat_at,
        millis(job.touched_at),
        job.persistent,
        job.state.finished_at().map(millis),
        serde_json::to_string(job)?,
    ])?;
    Ok(())
}

fn live_job(conn: &Connection, fingerprint: &str) -> StoreResult<Option<QueueJob>> {
    let sql = format!(
        "SELECT body FROM jobs WHERE fingerprint = ?1 AND status IN {} ORDER BY seq DESC LIMIT 1",
        LIVE_STATUSES
    );
    Ok(load_jobs(conn, &sql, &[&fingerprint])?.into_iter().next())
}

fn insert_job(conn: &Connection, mut job: QueueJob) -> StoreResult<QueueJob> {
    let seq: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs", [], |row| {
        row.get(0)
    })?;
    job.seq = seq as u64;
    job.record_stage("queued");
    save_job(conn, &job)?;
    Ok(job)
}

fn write_kv(conn: &Connection, write: &KvWrite) -> StoreResult<()> {
    let expires_at = write
        .ttl
        .map(|ttl| now_millis() + ttl.as_millis() as i64);
    conn.prepare_cached("INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)")?
        .execute(params![write.key, serde_json::to_string(&write.value)?, expires_at])?;
    Ok(())
}

fn finish_job(
    conn: &Connection,
    mut job: QueueJob,
    state: JobState,
    stage: &str,
) -> StoreResult<QueueJob> {
    job.state = state;
    job.record_stage(stage);
    save_job(conn, &job)?;
    Ok(job)
}

#[async_trait]
impl StoreDriver for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, Option<i64>)> = conn
                .prepare_cached("SELECT value, expires_at FROM kv WHERE key = ?1")?
                .query_row(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;

            match row {
                Some((_, Some(expires_at))) if expires_at <= now_millis() => {
                    conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                    Ok(None)
                }
                Some((value, _)) => Ok(Some(serde_json::from_str(&value)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        let write = KvWrite {
            key: key.to_string(),
            value,
            ttl,
        };
        self.with_conn(move |conn| write_kv(conn, &write)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM kv WHERE key = ?1", params![key])? > 0)
        })
        .await
    }

    async fn add_job(&self, job: QueueJob, force_renew: bool) -> StoreResult<AddJobOutcome> {
        self.write_tx(move |tx| match live_job(tx, &job.fingerprint)? {
            Some(mut existing) if !force_renew => {
                existing.touched_at = Utc::now();
                save_job(tx, &existing)?;
                Ok(AddJobOutcome::Joined(existing))
            }
            Some(existing) => {
                let cancelled = finish_job(
                    tx,
                    existing,
                    JobState::Cancelled {
                        reason: "superseded".to_string(),
                        cancelled_at: Utc::now(),
                    },
                    "cancelled: superseded",
                )?;
                let added = insert_job(tx, job)?;
                Ok(AddJobOutcome::Superseded { added, cancelled })
            }
            None => Ok(AddJobOutcome::Added(insert_job(tx, job)?)),
        })
        .await
    }

    async fn claim_next_job(
        &self,
        data_source: &str,
        max_active: usize,
        worker_id: &str,
    ) -> StoreResult<Option<QueueJob>> {
        let data_source = data_source.to_string();
        let worker_id = worker_id.to_string();
        self.write_tx(move |tx| {
            let active: i64 = tx.query_row(
                "SELECT COUNT(*) FROM jobs WHERE data_source = ?1 AND status = 'active'",
                params![data_source],
                |row| row.get(0),
            )?;
            if active as usize >= max_active {
                return Ok(None);
            }

            let next = load_jobs(
                tx,
                "SELECT body FROM jobs WHERE data_source = ?1 AND status = 'queued'
                 ORDER BY priority DESC, seq ASC LIMIT 1",
                &[&data_source],
            )?
            .into_iter()
            .next();

            match next {
                Some(mut job) => {
                    job.activate(&worker_id);
                    save_job(tx, &job)?;
                    Ok(Some(job))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn heartbeat_job(&self, id: Uuid, claim: Uuid) -> StoreResult<bool> {
        self.write_tx(move |tx| {
            let mut job = match load_job(tx, id)? {
                Some(job) if job.claim() == Some(claim) => job,
                _ => return Ok(false),
            };
            if let JobState::Active { heartbeat_at, .. } = &mut job.state {
                *heartbeat_at = Utc::now();
            }
            save_job(tx, &job)?;
            Ok(true)
        })
        .await
    }

    async fn complete_job(
        &self,
        id: Uuid,
        claim: Uuid,
        outcome: JobOutcome,
        write: Option<KvWrite>,
    ) -> StoreResult<bool> {
        self.write_tx(move |tx| {
            let job = match load_job(tx, id)? {
                Some(job) if job.claim() == Some(claim) => job,
                _ => return Ok(false),
            };
            let stage = match &outcome {
                JobOutcome::Done(_) => "completed",
                JobOutcome::Failed(_) => "failed",
            };
            finish_job(tx, job, outcome.into_state(), stage)?;
            if let Some(write) = &write {
                write_kv(tx, write)?;
            }
            Ok(true)
        })
        .await
    }

    async fn list_stalled(&self, timeout: Duration) -> StoreResult<Vec<QueueJob>> {
        self.write_tx(move |tx| {
            let cutoff = now_millis() - timeout.as_millis() as i64;
            let overdue = load_jobs(
                tx,
                "SELECT body FROM jobs WHERE status = 'active' AND heartbeat_at < ?1
                 ORDER BY priority DESC, seq ASC",
                &[&cutoff],
            )?;

            let mut stalled = Vec::with_capacity(overdue.len());
            for mut job in overdue {
                job.mark_stalled();
                save_job(tx, &job)?;
                stalled.push(job);
            }
            Ok(stalled)
        })
        .await
    }

    async fn requeue_job(&self, id: Uuid) -> StoreResult<bool> {
        self.write_tx(move |tx| match load_job(tx, id)? {
            Some(mut job) if job.status() == JobStatus::Stalled => {
                job.state = JobState::Queued;
                job.stall_count += 1;
                job.record_stage("requeued after stall");
                save_job(tx, &job)?;
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }

    async fn fail_job(&self, id: Uuid, error: OrchestratorError) -> StoreResult<bool> {
        self.write_tx(move |tx| match load_job(tx, id)? {
            Some(job) if matches!(job.status(), JobStatus::Queued | JobStatus::Stalled) => {
                let state = JobState::Error {
                    error,
                    completed_at: Utc::now(),
                };
                finish_job(tx, job, state, "failed")?;
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }

    async fn cancel_job(&self, id: Uuid, reason: &str) -> StoreResult<Option<QueueJob>> {
        let reason = reason.to_string();
        self.write_tx(move |tx| match load_job(tx, id)? {
            Some(job) if job.status().is_live() => {
                let stage = format!("cancelled: {}", reason);
                let state = JobState::Cancelled {
                    reason,
                    cancelled_at: Utc::now(),
                };
                Ok(Some(finish_job(tx, job, state, &stage)?))
            }
            _ => Ok(None),
        })
        .await
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<QueueJob>> {
        self.with_conn(move |conn| load_job(conn, id)).await
    }

    async fn find_job(&self, fingerprint: &str) -> StoreResult<Option<QueueJob>> {
        let fingerprint = fingerprint.to_string();
        self.with_conn(move |conn| live_job(conn, &fingerprint)).await
    }

    async fn touch_job(&self, id: Uuid) -> StoreResult<()> {
        self.write_tx(move |tx| {
            if let Some(mut job) = load_job(tx, id)? {
                job.touched_at = Utc::now();
                save_job(tx, &job)?;
            }
            Ok(())
        })
        .await
    }

    async fn list_jobs(&self, data_source: Option<&str>) -> StoreResult<Vec<QueueJob>> {
        let data_source = data_source.map(str::to_string);
        self.with_conn(move |conn| match &data_source {
            Some(ds) => load_jobs(
                conn,
                &format!(
                    "SELECT body FROM jobs WHERE status IN {} AND data_source = ?1
                     ORDER BY priority DESC, seq ASC",
                    LIVE_STATUSES
                ),
                &[ds],
            ),
            None => load_jobs(
                conn,
                &format!(
                    "SELECT body FROM jobs WHERE status IN {} ORDER BY priority DESC, seq ASC",
                    LIVE_STATUSES
                ),
                &[],
            ),
        })
        .await
    }

    async fn list_orphaned(&self, timeout: Duration) -> StoreResult<Vec<QueueJob>> {
        self.with_conn(move |conn| {
            let cutoff = now_millis() - timeout.as_millis() as i64;
            load_jobs(
                conn,
                &format!(
                    "SELECT body FROM jobs
                     WHERE status IN {} AND persistent = 0 AND touched_at < ?1",
                    LIVE_STATUSES
                ),
                &[&cutoff],
            )
        })
        .await
    }

    async fn purge_finished(&self, older_than: Duration) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            let cutoff = now_millis() - older_than.as_millis() as i64;
            Ok(conn.execute(
                "DELETE FROM jobs WHERE finished_at IS NOT NULL AND finished_at < ?1",
                params![cutoff],
            )?)
        })
        .await
    }

    async fn put_version_entry(&self, entry: VersionEntry) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO versions
                    (target_table_name, table_name, last_updated_at, body)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![
                entry.target_table_name(),
                entry.table_name,
                millis(entry.last_updated_at),
                serde_json::to_string(&entry)?,
            ])?;
            Ok(())
        })
        .await
    }

    async fn version_entries(&self, table_name: &str) -> StoreResult<Vec<VersionEntry>> {
        let table_name = table_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT body FROM versions WHERE table_name = ?1 ORDER BY last_updated_at DESC",
            )?;
            let bodies = stmt
                .query_map(params![table_name], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies
                .iter()
                .map(|body| serde_json::from_str(body).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn remove_version_entry(&self, entry: &VersionEntry) -> StoreResult<bool> {
        let target = entry.target_table_name();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM versions WHERE target_table_name = ?1",
                params![target],
            )?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_temp() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_kv_roundtrip_and_ttl() {
        let (store, _dir) = open_temp();
        conformance::kv_roundtrip_and_ttl(&store).await;
    }

    #[tokio::test]
    async fn test_add_job_joins_live_job() {
        let (store, _dir) = open_temp();
        conformance::add_job_joins_live_job(&store).await;
    }

    #[tokio::test]
    async fn test_force_renew_supersedes() {
        let (store, _dir) = open_temp();
        conformance::force_renew_supersedes(&store).await;
    }

    #[tokio::test]
    async fn test_claim_order_and_cap() {
        let (store, _dir) = open_temp();
        conformance::claim_order_and_cap(&store).await;
    }

    #[tokio::test]
    async fn test_complete_requires_claim() {
        let (store, _dir) = open_temp();
        conformance::complete_requires_claim(&store).await;
    }

    #[tokio::test]
    async fn test_stall_and_requeue() {
        let (store, _dir) = open_temp();
        conformance::stall_and_requeue(&store).await;
    }

    #[tokio::test]
    async fn test_orphans_and_purge() {
        let (store, _dir) = open_temp();
        conformance::orphans_and_purge(&store).await;
    }

    #[tokio::test]
    async fn test_version_entries() {
        let (store, _dir) = open_temp();
        conformance::version_entries(&store).await;
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let id = {
            let store = SqliteStore::open(&path).unwrap();
            let job = QueueJob::new("fp", "default", 3, QueryDef::sql("SELECT 1", vec![]));
            store.add_job(job, false).await.unwrap().job().id
        };

        let store = SqliteStore::open(&path).unwrap();
        let job = store.find_job("fp").await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.priority, 3);
    }

    /// Two handles on one file stand in for two orchestrator processes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_double_claim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let a = Arc::new(SqliteStore::open(&path).unwrap());
        let b = Arc::new(SqliteStore::open(&path).unwrap());

        for i in 0..20 {
            let def = QueryDef::sql("SELECT 1", vec![]);
            let job = QueueJob::new(format!("fp-{}", i), "default", 0, def);
            a.add_job(job, false).await.unwrap();
        }

        let mut handles = Vec::new();
        for (n, store) in [a.clone(), b.clone(), a.clone(), b.clone()].into_iter().enumerate() {
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store
                    .claim_next_job("default", usize::MAX, &format!("w{}", n))
                    .await
                    .unwrap()
                {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_job_single_live_job() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let stores: Vec<Arc<SqliteStore>> = (0..4)
            .map(|_| Arc::new(SqliteStore::open(&path).unwrap()))
            .collect();

        let mut handles = Vec::new();
        for store in stores.iter().cloned() {
            handles.push(tokio::spawn(async move {
                let job = QueueJob::new("same", "default", 0, QueryDef::sql("SELECT 1", vec![]));
                store.add_job(job, false).await.unwrap().job().id
            }));
        }

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(stores[0].list_jobs(None).await.unwrap().len(), 1);
    }
}
