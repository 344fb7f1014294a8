//! Persisted record types shared by every store backend
//!
//! - `QueueJob` / `JobState`: a unit of queued work and its typed lifecycle
//! - `QueryDef`: the serializable description of the work a job runs
//! - `CacheEntry`: a cached result keyed by query fingerprint
//! - `VersionEntry`: one physical build of a pre-aggregation partition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Smallest and largest priority a job may carry
pub const MIN_PRIORITY: i32 = -10_000;
pub const MAX_PRIORITY: i32 = 10_000;

/// Serializable description of the work a job performs.
///
/// `handler` names a `JobHandler` registered with the queue, so any
/// orchestrator process sharing the store can execute the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryDef {
    pub handler: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    /// Handler specific payload
    #[serde(default)]
    pub payload: Value,
}

impl QueryDef {
    /// Plain SQL execution against the job's data source
    pub fn sql(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            handler: "query".to_string(),
            sql: sql.into(),
            params,
            payload: Value::Null,
        }
    }

    /// Work executed by a custom handler
    pub fn handler(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            sql: String::new(),
            params: Vec::new(),
            payload: Value::Null,
        }
    }

    /// Builder method: set handler payload
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Plain status of a job, used for filtering and indexed columns
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Stalled,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    /// Whether the job can still produce a result
    pub fn is_live(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Active | JobStatus::Stalled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Stalled => "stalled",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a job with the data each state owns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active {
        worker_id: String,
        /// Token proving ownership; heartbeats and completion must present it
        claim: Uuid,
        claimed_at: DateTime<Utc>,
        heartbeat_at: DateTime<Utc>,
    },
    Stalled {
        worker_id: String,
        last_heartbeat_at: DateTime<Utc>,
    },
    Done {
        result: Value,
        completed_at: DateTime<Utc>,
    },
    Error {
        error: OrchestratorError,
        completed_at: DateTime<Utc>,
    },
    Cancelled {
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Active { .. } => JobStatus::Active,
            JobState::Stalled { .. } => JobStatus::Stalled,
            JobState::Done { .. } => JobStatus::Done,
            JobState::Error { .. } => JobStatus::Error,
            JobState::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    /// When the job reached a terminal state
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Done { completed_at, .. } | JobState::Error { completed_at, .. } => {
                Some(*completed_at)
            }
            JobState::Cancelled { cancelled_at, .. } => Some(*cancelled_at),
            _ => None,
        }
    }
}

/// Instructions for writing the cache entry when the job succeeds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheDirective {
    pub key: String,
    pub refresh_key_value: Option<String>,
    pub renewal_threshold_secs: Option<u64>,
    pub expire_secs: u64,
}

/// One recorded step of a job's lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    pub stage: String,
    pub at: DateTime<Utc>,
}

/// A unit of queued work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueJob {
    pub id: Uuid,
    pub fingerprint: String,
    pub priority: i32,
    pub data_source: String,
    /// Store assigned insertion order, FIFO tie breaker
    #[serde(default)]
    pub seq: u64,
    pub added_at: DateTime<Utc>,
    pub state: JobState,
    /// Times the job was claimed by a worker
    #[serde(default)]
    pub attempts: u32,
    /// Times the job was recovered after a stall
    #[serde(default)]
    pub stall_count: u32,
    /// Last time a waiter polled the job
    pub touched_at: DateTime<Utc>,
    /// Persistent jobs are never removed as orphans
    #[serde(default)]
    pub persistent: bool,
    pub def: QueryDef,
    #[serde(default)]
    pub cache: Option<CacheDirective>,
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
}

impl QueueJob {
    pub fn new(
        fingerprint: impl Into<String>,
        data_source: impl Into<String>,
        priority: i32,
        def: QueryDef,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.into(),
            priority,
            data_source: data_source.into(),
            seq: 0,
            added_at: now,
            state: JobState::Queued,
            attempts: 0,
            stall_count: 0,
            touched_at: now,
            persistent: false,
            def,
            cache: None,
            stage_results: Vec::new(),
        }
    }

    /// Builder method: keep the job alive without polling waiters
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Builder method: write a cache entry on success
    pub fn cache(mut self, directive: CacheDirective) -> Self {
        self.cache = Some(directive);
        self
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    /// Claim token of the current owner, if active
    pub fn claim(&self) -> Option<Uuid> {
        match &self.state {
            JobState::Active { claim, .. } => Some(*claim),
            _ => None,
        }
    }

    pub fn record_stage(&mut self, stage: impl Into<String>) {
        self.stage_results.push(StageResult {
            stage: stage.into(),
            at: Utc::now(),
        });
    }

    /// Move to `Active` under a fresh claim token
    pub fn activate(&mut self, worker_id: &str) -> Uuid {
        let now = Utc::now();
        let claim = Uuid::new_v4();
        self.state = JobState::Active {
            worker_id: worker_id.to_string(),
            claim,
            claimed_at: now,
            heartbeat_at: now,
        };
        self.attempts += 1;
        self.record_stage(format!("claimed by {}", worker_id));
        claim
    }

    /// Whether an active job missed its heartbeat deadline
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match &self.state {
            JobState::Active { heartbeat_at, .. } => {
                now.signed_duration_since(*heartbeat_at).num_milliseconds()
                    > timeout.as_millis() as i64
            }
            _ => false,
        }
    }

    /// Mark an overdue active job as stalled
    pub fn mark_stalled(&mut self) {
        if let JobState::Active {
            worker_id,
            heartbeat_at,
            ..
        } = &self.state
        {
            self.state = JobState::Stalled {
                worker_id: worker_id.clone(),
                last_heartbeat_at: *heartbeat_at,
            };
            self.record_stage("stalled");
        }
    }

    /// Whether no waiter polled the job for longer than `timeout`
    pub fn orphaned(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        !self.persistent
            && self.status().is_live()
            && now.signed_duration_since(self.touched_at).num_milliseconds()
                > timeout.as_millis() as i64
    }
}

/// Terminal result a worker reports for a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done(Value),
    Failed(OrchestratorError),
}

impl JobOutcome {
    pub(crate) fn into_state(self) -> JobState {
        let completed_at = Utc::now();
        match self {
            JobOutcome::Done(result) => JobState::Done {
                result,
                completed_at,
            },
            JobOutcome::Failed(error) => JobState::Error {
                error,
                completed_at,
            },
        }
    }
}

/// What `add_job` did with the submitted job
#[derive(Debug, Clone)]
pub enum AddJobOutcome {
    /// No live job existed; the job was inserted
    Added(QueueJob),
    /// A live job for the fingerprint exists; the caller joins it
    Joined(QueueJob),
    /// The live job was cancelled and the new one inserted
    Superseded {
        added: QueueJob,
        cancelled: QueueJob,
    },
}

impl AddJobOutcome {
    /// The job the caller should wait on
    pub fn job(&self) -> &QueueJob {
        match self {
            AddJobOutcome::Added(job) | AddJobOutcome::Joined(job) => job,
            AddJobOutcome::Superseded { added, .. } => added,
        }
    }
}

/// A key-value write applied atomically with a job completion
#[derive(Debug, Clone, PartialEq)]
pub struct KvWrite {
    pub key: String,
    pub value: Value,
    pub ttl: Option<Duration>,
}

/// A cached query result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub value: Value,
    /// Hash of the refresh key query result at compute time
    pub refresh_key_value: Option<String>,
    pub stored_at: DateTime<Utc>,
    pub renewal_threshold_secs: Option<u64>,
    pub hard_expiration: DateTime<Utc>,
}

impl CacheEntry {
    /// Entries past their hard expiration are never served
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.hard_expiration
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Naming scheme of physical partition tables
pub const NAMING_VERSION: u32 = 2;

const BASE32_ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Encode a non-negative integer with the lowercase base32 alphabet
pub fn to_base32(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(BASE32_ALPHABET[(n % 32) as usize]);
        n /= 32;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// One physical build of a pre-aggregation partition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionEntry {
    /// Logical partition table name
    pub table_name: String,
    pub structure_version: String,
    pub content_version: String,
    pub last_updated_at: DateTime<Utc>,
    pub naming_version: u32,
    /// Data source holding the physical table
    pub data_source: String,
    #[serde(default)]
    pub build_range_end: Option<DateTime<Utc>>,
}

impl VersionEntry {
    pub fn new(
        table_name: impl Into<String>,
        structure_version: impl Into<String>,
        content_version: impl Into<String>,
        data_source: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            structure_version: structure_version.into(),
            content_version: content_version.into(),
            last_updated_at: Utc::now(),
            naming_version: NAMING_VERSION,
            data_source: data_source.into(),
            build_range_end: None,
        }
    }

    /// Name of the physical table this entry refers to
    pub fn target_table_name(&self) -> String {
        if self.naming_version >= NAMING_VERSION {
            format!(
                "{}_{}_{}_{}",
                self.table_name,
                self.content_version,
                self.structure_version,
                to_base32(self.last_updated_at.timestamp_millis().max(0) as u64)
            )
        } else {
            format!(
                "{}_{}_{}_{}",
                self.table_name,
                self.content_version,
                self.structure_version,
                self.last_updated_at.timestamp()
            )
        }
    }
}

/// Pick the newest entry among those sharing `structure_version`
pub fn latest_version<'a>(
    entries: &'a [VersionEntry],
    structure_version: &str,
) -> Option<&'a VersionEntry> {
    entries
        .iter()
        .filter(|e| e.structure_version == structure_version)
        .max_by_key(|e| e.last_updated_at)
}
