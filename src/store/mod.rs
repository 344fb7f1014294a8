//! Cache/Queue Store
//!
//! The minimal key-value and atomic-queue protocol the queue, the cache and the
//! pre-aggregation layer are written against. Two backends implement it:
//!
//! - [`MemoryStore`]: maps behind a mutex, for a single orchestrator process
//! - [`SqliteStore`]: a SQLite file shared by several orchestrator processes,
//!   with every queue transition done inside one `BEGIN IMMEDIATE` transaction
//!
//! The backend is chosen at startup with [`open_store`] and passed explicitly
//! to every component that needs it.
//!
//! # Atomicity
//!
//! - `add_job` checks for a live job and inserts in one step, so a fingerprint
//!   never has two live jobs.
//! - `claim_next_job` counts active jobs and claims the next queued one in one
//!   step, so the per-data-source concurrency cap holds across processes and no
//!   job is claimed twice.
//! - `complete_job` and `heartbeat_job` compare the claim token first. A worker
//!   that lost ownership (stall recovery, cancellation) cannot overwrite the
//!   job or its cache entry.

#[cfg(test)]
mod conformance;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
    latest_version, to_base32, AddJobOutcome, CacheDirective, CacheEntry, JobOutcome, JobState,
    JobStatus, KvWrite, QueryDef, QueueJob, StageResult, VersionEntry, MAX_PRIORITY, MIN_PRIORITY,
    NAMING_VERSION,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Abstract cache/queue store
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Backend name for logs and health output
    fn backend(&self) -> &'static str;

    // Key-value

    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    // Queue

    /// Insert `job`, or join the live job for its fingerprint.
    ///
    /// With `force_renew` a live job is cancelled and `job` inserted in its place.
    async fn add_job(&self, job: QueueJob, force_renew: bool) -> StoreResult<AddJobOutcome>;

    /// Claim the highest priority queued job of `data_source` (FIFO within a
    /// priority) unless `max_active` jobs are already active there.
    async fn claim_next_job(
        &self,
        data_source: &str,
        max_active: usize,
        worker_id: &str,
    ) -> StoreResult<Option<QueueJob>>;

    /// Refresh the heartbeat. Returns `false` when `claim` no longer owns the job.
    async fn heartbeat_job(&self, id: Uuid, claim: Uuid) -> StoreResult<bool>;

    /// Record the outcome and apply `write` only if `claim` still owns the job.
    async fn complete_job(
        &self,
        id: Uuid,
        claim: Uuid,
        outcome: JobOutcome,
        write: Option<KvWrite>,
    ) -> StoreResult<bool>;

    /// Move active jobs whose heartbeat is older than `timeout` to `Stalled`
    /// and return them.
    async fn list_stalled(&self, timeout: Duration) -> StoreResult<Vec<QueueJob>>;

    /// Put a stalled job back in the queue
    async fn requeue_job(&self, id: Uuid) -> StoreResult<bool>;

    /// Fail a job that is not active
    async fn fail_job(&self, id: Uuid, error: crate::error::OrchestratorError) -> StoreResult<bool>;

    /// Cancel a live job. Returns the cancelled job.
    async fn cancel_job(&self, id: Uuid, reason: &str) -> StoreResult<Option<QueueJob>>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<QueueJob>>;

    /// The live job for a fingerprint
    async fn find_job(&self, fingerprint: &str) -> StoreResult<Option<QueueJob>>;

    /// Record that a waiter is still interested in the job
    async fn touch_job(&self, id: Uuid) -> StoreResult<()>;

    /// Live jobs, optionally restricted to one data source, in dequeue order
    async fn list_jobs(&self, data_source: Option<&str>) -> StoreResult<Vec<QueueJob>>;

    /// Live, non-persistent jobs nobody polled for longer than `timeout`
    async fn list_orphaned(&self, timeout: Duration) -> StoreResult<Vec<QueueJob>>;

    /// Drop finished jobs older than `older_than`. Returns how many were removed.
    async fn purge_finished(&self, older_than: Duration) -> StoreResult<usize>;

    // Pre-aggregation versions

    async fn put_version_entry(&self, entry: VersionEntry) -> StoreResult<()>;

    async fn version_entries(&self, table_name: &str) -> StoreResult<Vec<VersionEntry>>;

    async fn remove_version_entry(&self, entry: &VersionEntry) -> StoreResult<bool>;
}

/// Store backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(StoreError::Config(format!("Unknown store backend: {}", other))),
        }
    }
}

/// Store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Database file for the sqlite backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conductor")
        .join("store.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
        }
    }
}

/// Open the configured backend
pub fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn StoreDriver>> {
    let store: Arc<dyn StoreDriver> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.path)?),
    };

    tracing::info!(backend = store.backend(), "Opened cache/queue store");
    Ok(store)
}

/// Key under which the cache entry for a fingerprint lives
pub fn cache_key(fingerprint: &str) -> String {
    format!("cache:{}", fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_backend_from_str() {
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("SQLite".parse::<StoreBackend>().unwrap(), StoreBackend::Sqlite);
        assert!("redis".parse::<StoreBackend>().is_err());
    }

    #[tokio::test]
    async fn test_open_store_selects_backend() {
        let store = open_store(&StoreConfig::default()).unwrap();
        assert_eq!(store.backend(), "memory");

        let dir = tempdir().unwrap();
        let config = StoreConfig {
            backend: StoreBackend::Sqlite,
            path: dir.path().join("store.db"),
        };
        let store = open_store(&config).unwrap();
        assert_eq!(store.backend(), "sqlite");
    }
}
