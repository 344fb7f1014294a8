//! In-process store backend
//!
//! All state sits behind one mutex, so every queue transition is trivially
//! atomic. Suitable for a single orchestrator process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::types::*;
use super::{StoreDriver, StoreResult};
use crate::error::OrchestratorError;

#[derive(Default)]
struct MemoryState {
    kv: HashMap<String, (Value, Option<DateTime<Utc>>)>,
    jobs: HashMap<Uuid, QueueJob>,
    /// Fingerprint to its live job
    live: HashMap<String, Uuid>,
    versions: HashMap<String, Vec<VersionEntry>>,
    next_seq: u64,
}

impl MemoryState {
    fn insert_job(&mut self, mut job: QueueJob) -> QueueJob {
        self.next_seq += 1;
        job.seq = self.next_seq;
        job.record_stage("queued");
        self.live.insert(job.fingerprint.clone(), job.id);
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn finish(&mut self, id: Uuid, state: JobState, stage: &str) -> Option<QueueJob> {
        let job = self.jobs.get_mut(&id)?;
        job.state = state;
        job.record_stage(stage);
        if self.live.get(&job.fingerprint) == Some(&id) {
            self.live.remove(&job.fingerprint);
        }
        Some(job.clone())
    }

    fn set_kv(&mut self, write: KvWrite) {
        let expires_at = write
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        self.kv.insert(write.key, (write.value, expires_at));
    }
}

/// Store backend holding everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Dequeue order: priority descending, then insertion order
fn dequeue_order(a: &QueueJob, b: &QueueJob) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
}

#[async_trait]
impl StoreDriver for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let mut state = self.state.lock()?;
        let expired = match state.kv.get(key) {
            Some((_, Some(expires_at))) => *expires_at <= Utc::now(),
            Some(_) => false,
            None => return Ok(None),
        };
        if expired {
            state.kv.remove(key);
            return Ok(None);
        }
        Ok(state.kv.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        let mut state = self.state.lock()?;
        state.set_kv(KvWrite {
            key: key.to_string(),
            value,
            ttl,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.state.lock()?.kv.remove(key).is_some())
    }

    async fn add_job(&self, job: QueueJob, force_renew: bool) -> StoreResult<AddJobOutcome> {
        let mut state = self.state.lock()?;

        let existing = state
            .live
            .get(&job.fingerprint)
            .and_then(|id| state.jobs.get(id))
            .filter(|j| j.status().is_live())
            .map(|j| j.id);

        match existing {
            Some(id) if !force_renew => {
                let existing = state.jobs.get_mut(&id).map(|j| {
                    j.touched_at = Utc::now();
                    j.clone()
                });
                match existing {
                    Some(job) => Ok(AddJobOutcome::Joined(job)),
                    None => Ok(AddJobOutcome::Added(state.insert_job(job))),
                }
            }
            Some(id) => {
                let cancelled = state.finish(
                    id,
                    JobState::Cancelled {
                        reason: "superseded".to_string(),
                        cancelled_at: Utc::now(),
                    },
                    "cancelled: superseded",
                );
                let added = state.insert_job(job);
                match cancelled {
                    Some(cancelled) => Ok(AddJobOutcome::Superseded { added, cancelled }),
                    None => Ok(AddJobOutcome::Added(added)),
                }
            }
            None => Ok(AddJobOutcome::Added(state.insert_job(job))),
        }
    }

    async fn claim_next_job(
        &self,
        data_source: &str,
        max_active: usize,
        worker_id: &str,
    ) -> StoreResult<Option<QueueJob>> {
        let mut state = self.state.lock()?;

        let active = state
            .jobs
            .values()
            .filter(|j| j.data_source == data_source && j.status() == JobStatus::Active)
            .count();
        if active >= max_active {
            return Ok(None);
        }

        let next = state
            .jobs
            .values()
            .filter(|j| j.data_source == data_source && j.status() == JobStatus::Queued)
            .min_by(|a, b| dequeue_order(a, b))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            state.jobs.get_mut(&id).map(|job| {
                job.activate(worker_id);
                job.clone()
            })
        }))
    }

    async fn heartbeat_job(&self, id: Uuid, claim: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock()?;
        match state.jobs.get_mut(&id).map(|j| &mut j.state) {
            Some(JobState::Active {
                claim: owner,
                heartbeat_at,
                ..
            }) if *owner == claim => {
                *heartbeat_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_job(
        &self,
        id: Uuid,
        claim: Uuid,
        outcome: JobOutcome,
        write: Option<KvWrite>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock()?;
        let owned = state.jobs.get(&id).and_then(|j| j.claim()) == Some(claim);
        if !owned {
            return Ok(false);
        }

        let stage = match &outcome {
            JobOutcome::Done(_) => "completed",
            JobOutcome::Failed(_) => "failed",
        };
        state.finish(id, outcome.into_state(), stage);
        if let Some(write) = write {
            state.set_kv(write);
        }
        Ok(true)
    }

    async fn list_stalled(&self, timeout: Duration) -> StoreResult<Vec<QueueJob>> {
        let mut state = self.state.lock()?;
        let now = Utc::now();
        let mut stalled = Vec::new();
        for job in state.jobs.values_mut() {
            if job.heartbeat_expired(now, timeout) {
                job.mark_stalled();
                stalled.push(job.clone());
            }
        }
        stalled.sort_by(dequeue_order);
        Ok(stalled)
    }

    async fn requeue_job(&self, id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock()?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status() == JobStatus::Stalled => {
                job.state = JobState::Queued;
                job.stall_count += 1;
                job.record_stage("requeued after stall");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_job(&self, id: Uuid, error: OrchestratorError) -> StoreResult<bool> {
        let mut state = self.state.lock()?;
        let failable = matches!(
            state.jobs.get(&id).map(|j| j.status()),
            Some(JobStatus::Queued) | Some(JobStatus::Stalled)
        );
        if !failable {
            return Ok(false);
        }
        let failed = state.finish(
            id,
            JobState::Error {
                error,
                completed_at: Utc::now(),
            },
            "failed",
        );
        Ok(failed.is_some())
    }

    async fn cancel_job(&self, id: Uuid, reason: &str) -> StoreResult<Option<QueueJob>> {
        let mut state = self.state.lock()?;
        let live = state
            .jobs
            .get(&id)
            .map(|j| j.status().is_live())
            .unwrap_or(false);
        if !live {
            return Ok(None);
        }
        Ok(state.finish(
            id,
            JobState::Cancelled {
                reason: reason.to_string(),
                cancelled_at: Utc::now(),
            },
            &format!("cancelled: {}", reason),
        ))
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<QueueJob>> {
        Ok(self.state.lock()?.jobs.get(&id).cloned())
    }

    async fn find_job(&self, fingerprint: &str) -> StoreResult<Option<QueueJob>> {
        let state = self.state.lock()?;
        Ok(state
            .live
            .get(fingerprint)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn touch_job(&self, id: Uuid) -> StoreResult<()> {
        if let Some(job) = self.state.lock()?.jobs.get_mut(&id) {
            job.touched_at = Utc::now();
        }
        Ok(())
    }

    async fn list_jobs(&self, data_source: Option<&str>) -> StoreResult<Vec<QueueJob>> {
        let state = self.state.lock()?;
        let mut jobs: Vec<QueueJob> = state
            .jobs
            .values()
            .filter(|j| j.status().is_live())
            .filter(|j| data_source.map(|ds| j.data_source == ds).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(dequeue_order);
        Ok(jobs)
    }

    async fn list_orphaned(&self, timeout: Duration) -> StoreResult<Vec<QueueJob>> {
        let state = self.state.lock()?;
        let now = Utc::now();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.orphaned(now, timeout))
            .cloned()
            .collect())
    }

    async fn purge_finished(&self, older_than: Duration) -> StoreResult<usize> {
        let mut state = self.state.lock()?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, j| j.state.finished_at().map(|at| at > cutoff).unwrap_or(true));
        Ok(before - state.jobs.len())
    }

    async fn put_version_entry(&self, entry: VersionEntry) -> StoreResult<()> {
        let mut state = self.state.lock()?;
        let entries = state.versions.entry(entry.table_name.clone()).or_default();
        entries.retain(|e| e.target_table_name() != entry.target_table_name());
        entries.push(entry);
        Ok(())
    }

    async fn version_entries(&self, table_name: &str) -> StoreResult<Vec<VersionEntry>> {
        let state = self.state.lock()?;
        let mut entries = state.versions.get(table_name).cloned().unwrap_or_default();
        entries.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        Ok(entries)
    }

    async fn remove_version_entry(&self, entry: &VersionEntry) -> StoreResult<bool> {
        let mut state = self.state.lock()?;
        let target = entry.target_table_name();
        match state.versions.get_mut(&entry.table_name) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|e| e.target_table_name() != target);
                Ok(entries.len() < before)
            }
            None => Ok(false),
        }
    }
}
