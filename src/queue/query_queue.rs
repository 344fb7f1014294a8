//! Query Queue
//!
//! Single-flight execution of queued work on top of a [`StoreDriver`]:
//!
//! - `enqueue` inserts a job or joins the live job for the same fingerprint
//! - workers claim jobs per data source, highest priority first, never more
//!   than the configured concurrency at a time
//! - a running job heartbeats; maintenance marks silent jobs stalled and
//!   requeues them (or fails them once the retry budget is spent)
//! - waiters long-poll the job and get `ContinueWait` when their deadline
//!   passes while the job is still running
//!
//! Waiters in this process are woken through a per-job `Notify`; waiters in
//! other processes fall back to polling the store.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::fingerprint::QueryFingerprint;
use super::handler::{HandlerRegistry, JobHandler};
use super::retry::{retry_transient, RetryPolicy};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::store::{
    AddJobOutcome, CacheDirective, CacheEntry, JobOutcome, JobState, JobStatus, KvWrite, QueryDef,
    QueueJob, StoreDriver, MAX_PRIORITY, MIN_PRIORITY,
};

/// Queue timing and concurrency settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Active jobs per data source unless overridden
    pub default_concurrency: usize,
    /// Per data source overrides
    pub concurrency: HashMap<String, usize>,
    /// How long a waiter blocks before receiving `ContinueWait`
    pub continue_wait_timeout: Duration,
    /// Heartbeat silence after which an active job is stalled
    pub stalled_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Poll silence after which a non-persistent job is cancelled
    pub orphaned_timeout: Duration,
    /// Bound on a single handler execution
    pub execution_timeout: Duration,
    /// Stall recoveries before a job fails with `Stalled`
    pub max_stall_retries: u32,
    pub retry: RetryPolicy,
    /// Store polling interval of waiters
    pub poll_interval: Duration,
    pub maintenance_interval: Duration,
    /// How long finished jobs stay readable
    pub result_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 2,
            concurrency: HashMap::new(),
            continue_wait_timeout: Duration::from_secs(5),
            stalled_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            orphaned_timeout: Duration::from_secs(120),
            execution_timeout: Duration::from_secs(600),
            max_stall_retries: 1,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(100),
            maintenance_interval: Duration::from_secs(1),
            result_ttl: Duration::from_secs(600),
        }
    }
}

impl QueueConfig {
    pub fn concurrency_for(&self, data_source: &str) -> usize {
        self.concurrency
            .get(data_source)
            .copied()
            .unwrap_or(self.default_concurrency)
            .max(1)
    }

    /// Builder method: set concurrency of one data source
    pub fn with_concurrency(mut self, data_source: impl Into<String>, concurrency: usize) -> Self {
        self.concurrency.insert(data_source.into(), concurrency);
        self
    }
}

/// A request to run (or join) work for a fingerprint
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub fingerprint: QueryFingerprint,
    pub data_source: String,
    pub priority: i32,
    pub def: QueryDef,
    /// Cancel the live job for this fingerprint and start over
    pub force_renew: bool,
    pub persistent: bool,
    pub cache: Option<CacheDirective>,
}

impl EnqueueRequest {
    pub fn new(
        fingerprint: QueryFingerprint,
        data_source: impl Into<String>,
        def: QueryDef,
    ) -> Self {
        Self {
            fingerprint,
            data_source: data_source.into(),
            priority: 0,
            def,
            force_renew: false,
            persistent: false,
            cache: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn force_renew(mut self, force_renew: bool) -> Self {
        self.force_renew = force_renew;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn cache(mut self, directive: CacheDirective) -> Self {
        self.cache = Some(directive);
        self
    }
}

/// Handle on the job a caller is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub fingerprint: QueryFingerprint,
    /// The caller attached to an already live job
    pub joined: bool,
}

/// Where a live job currently is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum QueryStage {
    Queued { position: usize },
    Executing { elapsed_ms: u64 },
    Stalled,
}

impl std::fmt::Display for QueryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStage::Queued { position } => write!(f, "#{} in queue", position),
            QueryStage::Executing { .. } => write!(f, "Executing query"),
            QueryStage::Stalled => write!(f, "Stalled"),
        }
    }
}

/// Counts from one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub requeued: usize,
    pub failed: usize,
    pub orphaned: usize,
    pub purged: usize,
}

/// Deduplicating, priority ordered, concurrency limited job queue
pub struct QueryQueue {
    store: Arc<dyn StoreDriver>,
    handlers: HandlerRegistry,
    config: QueueConfig,
    worker_id: String,
    signals: Mutex<HashMap<Uuid, Arc<Notify>>>,
    running: RwLock<bool>,
}

impl QueryQueue {
    pub fn new(store: Arc<dyn StoreDriver>, config: QueueConfig) -> Self {
        Self {
            store,
            handlers: HandlerRegistry::new(),
            config,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            signals: Mutex::new(HashMap::new()),
            running: RwLock::new(false),
        }
    }

    /// Builder method: set the worker identity recorded on claimed jobs
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.register(name, handler);
    }

    pub fn store(&self) -> &Arc<dyn StoreDriver> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_id
    }

    /// Run `request`'s work or join the live job for its fingerprint, waiting
    /// at most the continue-wait timeout.
    pub async fn enqueue_or_join(
        self: &Arc<Self>,
        request: EnqueueRequest,
    ) -> OrchestratorResult<Value> {
        let ticket = self.enqueue(request).await?;
        self.wait(&ticket, Some(self.config.continue_wait_timeout))
            .await
    }

    /// Insert or join a job and dispatch queued work. Does not wait.
    pub async fn enqueue(
        self: &Arc<Self>,
        request: EnqueueRequest,
    ) -> OrchestratorResult<JobTicket> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&request.priority) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "Priority should be between {} and {}, got {}",
                MIN_PRIORITY, MAX_PRIORITY, request.priority
            )));
        }

        let mut job = QueueJob::new(
            request.fingerprint.as_str(),
            request.data_source.as_str(),
            request.priority,
            request.def,
        )
        .persistent(request.persistent);
        if let Some(directive) = request.cache {
            job = job.cache(directive);
        }

        let outcome = self.store.add_job(job, request.force_renew).await?;
        let joined = matches!(outcome, AddJobOutcome::Joined(_));

        match &outcome {
            AddJobOutcome::Added(job) => info!(
                fingerprint = %request.fingerprint.short(),
                data_source = %job.data_source,
                priority = job.priority,
                "Added to queue"
            ),
            AddJobOutcome::Joined(job) => debug!(
                fingerprint = %request.fingerprint.short(),
                job_id = %job.id,
                status = %job.status(),
                "Joined in-flight job"
            ),
            AddJobOutcome::Superseded { cancelled, .. } => {
                info!(
                    fingerprint = %request.fingerprint.short(),
                    job_id = %cancelled.id,
                    "Cancelled superseded job"
                );
                self.notify(cancelled.id);
            }
        }

        let ticket = JobTicket {
            job_id: outcome.job().id,
            fingerprint: request.fingerprint,
            joined,
        };
        self.reconcile(&request.data_source).await;
        Ok(ticket)
    }

    /// Wait for the ticket's job to finish.
    ///
    /// With a timeout, returns `ContinueWait` if the job is still live when it
    /// elapses. Every poll marks the job as still wanted.
    pub async fn wait(
        &self,
        ticket: &JobTicket,
        timeout: Option<Duration>,
    ) -> OrchestratorResult<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let signal = self.signal(ticket.job_id);
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = self.store.get_job(ticket.job_id).await?.ok_or_else(|| {
                OrchestratorError::Store(format!("Job {} no longer exists", ticket.job_id))
            })?;

            let finished = match job.state {
                JobState::Done { result, .. } => Some(Ok(result)),
                JobState::Error { error, .. } => Some(Err(error)),
                JobState::Cancelled { .. } => Some(Err(OrchestratorError::Cancelled {
                    fingerprint: ticket.fingerprint.to_string(),
                })),
                _ => None,
            };
            if let Some(result) = finished {
                self.forget(ticket.job_id);
                return result;
            }

            self.store.touch_job(ticket.job_id).await?;

            let mut sleep_for = self.config.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    debug!(fingerprint = %ticket.fingerprint.short(), "Continue wait");
                    return Err(OrchestratorError::ContinueWait);
                }
                sleep_for = sleep_for.min(deadline - now);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Cancel the live job for a fingerprint. Returns whether one existed.
    pub async fn cancel(&self, fingerprint: &QueryFingerprint) -> OrchestratorResult<bool> {
        let Some(job) = self.store.find_job(fingerprint.as_str()).await? else {
            return Ok(false);
        };
        let cancelled = self.store.cancel_job(job.id, "cancelled by request").await?;
        if cancelled.is_some() {
            info!(fingerprint = %fingerprint.short(), job_id = %job.id, "Cancelled job");
            self.notify(job.id);
        }
        Ok(cancelled.is_some())
    }

    /// Refresh the heartbeat of the active job for a fingerprint.
    ///
    /// For workers that execute a job outside this queue's worker tasks.
    pub async fn heartbeat(&self, fingerprint: &QueryFingerprint) -> OrchestratorResult<bool> {
        let Some(job) = self.store.find_job(fingerprint.as_str()).await? else {
            return Ok(false);
        };
        match job.claim() {
            Some(claim) => Ok(self.store.heartbeat_job(job.id, claim).await?),
            None => Ok(false),
        }
    }

    /// Where the live job for a fingerprint is
    pub async fn query_stage(
        &self,
        fingerprint: &QueryFingerprint,
    ) -> OrchestratorResult<Option<QueryStage>> {
        let Some(job) = self.store.find_job(fingerprint.as_str()).await? else {
            return Ok(None);
        };

        let stage = match &job.state {
            JobState::Active { claimed_at, .. } => QueryStage::Executing {
                elapsed_ms: Utc::now()
                    .signed_duration_since(*claimed_at)
                    .num_milliseconds()
                    .max(0) as u64,
            },
            JobState::Stalled { .. } => QueryStage::Stalled,
            JobState::Queued => {
                let queued = self.store.list_jobs(Some(&job.data_source)).await?;
                let position = queued
                    .iter()
                    .filter(|j| j.status() == JobStatus::Queued)
                    .position(|j| j.id == job.id)
                    .map(|p| p + 1)
                    .unwrap_or(1);
                QueryStage::Queued { position }
            }
            _ => return Ok(None),
        };
        Ok(Some(stage))
    }

    /// Live jobs in dequeue order
    pub async fn jobs(&self, data_source: Option<&str>) -> OrchestratorResult<Vec<QueueJob>> {
        Ok(self.store.list_jobs(data_source).await?)
    }

    /// Claim queued jobs of `data_source` up to its concurrency and start a
    /// worker for each.
    pub async fn reconcile(self: &Arc<Self>, data_source: &str) {
        loop {
            match self.claim(data_source).await {
                Some(job) => self.spawn_worker(job),
                None => break,
            }
        }
    }

    async fn claim(&self, data_source: &str) -> Option<QueueJob> {
        let max_active = self.config.concurrency_for(data_source);
        match self
            .store
            .claim_next_job(data_source, max_active, &self.worker_id)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                error!(data_source = %data_source, error = %e, "Failed to claim job");
                None
            }
        }
    }

    /// A worker runs its job, then keeps claiming from the same data source
    /// until nothing is claimable.
    fn spawn_worker(self: &Arc<Self>, job: QueueJob) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let data_source = job.data_source.clone();
            let mut next = Some(job);
            while let Some(job) = next.take() {
                queue.run_job(job).await;
                next = queue.claim(&data_source).await;
            }
        });
    }

    async fn run_job(&self, job: QueueJob) {
        let Some(claim) = job.claim() else {
            return;
        };
        let started = Instant::now();
        info!(
            fingerprint = %QueryFingerprint::from_hex(job.fingerprint.as_str()).short(),
            job_id = %job.id,
            data_source = %job.data_source,
            attempt = job.attempts,
            "Performing query"
        );

        let execution = self.execute(&job);
        tokio::pin!(execution);

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await;

        let result = loop {
            let signal = self.signal(job.id);
            let notified = signal.notified();
            tokio::select! {
                result = &mut execution => break Some(result),
                _ = ticker.tick() => {
                    match self.store.heartbeat_job(job.id, claim).await {
                        Ok(true) => {}
                        Ok(false) => break None,
                        Err(e) => warn!(job_id = %job.id, error = %e, "Heartbeat failed"),
                    }
                }
                _ = notified => {
                    if !self.owns(job.id, claim).await {
                        break None;
                    }
                }
            }
        };

        let Some(result) = result else {
            info!(job_id = %job.id, "Worker lost ownership of job, abandoning execution");
            self.notify(job.id);
            return;
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (outcome, write) = match result {
            Ok(value) => {
                let write = job
                    .cache
                    .as_ref()
                    .and_then(|directive| cache_write(&job, directive, &value));
                (JobOutcome::Done(value), write)
            }
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    error = %e,
                    duration_ms = elapsed_ms,
                    "Error while querying"
                );
                (JobOutcome::Failed(e), None)
            }
        };

        match self.store.complete_job(job.id, claim, outcome, write).await {
            Ok(true) => {
                info!(job_id = %job.id, duration_ms = elapsed_ms, "Performing query completed")
            }
            Ok(false) => {
                warn!(job_id = %job.id, "Job changed owner before completion, result discarded")
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job outcome"),
        }
        self.notify(job.id);
    }

    /// Run the job's handler with the execution timeout, retrying transient failures
    async fn execute(&self, job: &QueueJob) -> OrchestratorResult<Value> {
        let handler = self.handlers.get(&job.def.handler).ok_or_else(|| {
            OrchestratorError::InvalidRequest(format!("Unknown job handler: {}", job.def.handler))
        })?;
        let timeout = self.config.execution_timeout;

        retry_transient(&job.def.handler, self.config.retry, || {
            let handler = Arc::clone(&handler);
            async move {
                match tokio::time::timeout(timeout, handler.execute(job)).await {
                    Ok(result) => result,
                    Err(_) => Err(OrchestratorError::ExecutionTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        })
        .await
    }

    async fn owns(&self, id: Uuid, claim: Uuid) -> bool {
        match self.store.get_job(id).await {
            Ok(Some(job)) => job.claim() == Some(claim),
            Ok(None) => false,
            Err(_) => true,
        }
    }

    fn signal(&self, id: Uuid) -> Arc<Notify> {
        match self.signals.lock() {
            Ok(mut signals) => {
                Arc::clone(signals.entry(id).or_insert_with(|| Arc::new(Notify::new())))
            }
            Err(_) => Arc::new(Notify::new()),
        }
    }

    /// Wake local waiters and the local worker of a job
    fn notify(&self, id: Uuid) {
        if let Some(signal) = self.forget(id) {
            signal.notify_waiters();
        }
    }

    fn forget(&self, id: Uuid) -> Option<Arc<Notify>> {
        self.signals.lock().ok().and_then(|mut s| s.remove(&id))
    }

    /// Recover stalled jobs, cancel orphans, purge old results and dispatch
    /// queued work.
    pub async fn run_maintenance(self: &Arc<Self>) -> OrchestratorResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        for job in self.store.list_stalled(self.config.stalled_timeout).await? {
            if job.stall_count < self.config.max_stall_retries {
                if self.store.requeue_job(job.id).await? {
                    info!(
                        job_id = %job.id,
                        stall_count = job.stall_count + 1,
                        "Requeued stalled job"
                    );
                    report.requeued += 1;
                }
            } else {
                let error = OrchestratorError::Stalled {
                    fingerprint: job.fingerprint.clone(),
                    attempts: job.attempts,
                };
                if self.store.fail_job(job.id, error).await? {
                    warn!(job_id = %job.id, attempts = job.attempts, "Stalled job failed");
                    report.failed += 1;
                }
            }
            self.notify(job.id);
        }

        for job in self.store.list_orphaned(self.config.orphaned_timeout).await? {
            if self.store.cancel_job(job.id, "orphaned").await?.is_some() {
                info!(job_id = %job.id, "Removing orphaned job");
                report.orphaned += 1;
                self.notify(job.id);
            }
        }

        report.purged = self.store.purge_finished(self.config.result_ttl).await?;

        let data_sources: BTreeSet<String> = self
            .store
            .list_jobs(None)
            .await?
            .into_iter()
            .filter(|j| j.status() == JobStatus::Queued)
            .map(|j| j.data_source)
            .collect();
        for data_source in data_sources {
            self.reconcile(&data_source).await;
        }

        Ok(report)
    }

    /// Start the maintenance loop
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = self;

        tokio::spawn(async move {
            *queue.running.write().await = true;

            let mut interval = tokio::time::interval(queue.config.maintenance_interval);

            loop {
                interval.tick().await;

                if !*queue.running.read().await {
                    break;
                }

                if let Err(e) = queue.run_maintenance().await {
                    error!(error = %e, "Queue maintenance failed");
                }
            }
        })
    }

    /// Stop the maintenance loop
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}

/// Cache entry a successful job writes atomically with its completion
fn cache_write(job: &QueueJob, directive: &CacheDirective, value: &Value) -> Option<KvWrite> {
    let now = Utc::now();
    let entry = CacheEntry {
        fingerprint: job.fingerprint.clone(),
        value: value.clone(),
        refresh_key_value: directive.refresh_key_value.clone(),
        stored_at: now,
        renewal_threshold_secs: directive.renewal_threshold_secs,
        hard_expiration: now + chrono::Duration::seconds(directive.expire_secs as i64),
    };
    match serde_json::to_value(&entry) {
        Ok(value) => Some(KvWrite {
            key: directive.key.clone(),
            value,
            ttl: Some(Duration::from_secs(directive.expire_secs)),
        }),
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to encode cache entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> QueueConfig {
        QueueConfig {
            default_concurrency: 2,
            continue_wait_timeout: Duration::from_secs(5),
            stalled_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            retry: RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..Default::default()
        }
    }

    fn queue(config: QueueConfig) -> Arc<QueryQueue> {
        Arc::new(QueryQueue::new(Arc::new(MemoryStore::new()), config))
    }

    fn request(name: &str, handler: &str) -> EnqueueRequest {
        EnqueueRequest::new(
            QueryFingerprint::of(&name),
            "default",
            QueryDef::handler(handler).payload(json!(name)),
        )
    }

    /// Counts executions, sleeps, then echoes the payload
    struct Counting {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn execute(&self, job: &QueueJob) -> OrchestratorResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(json!({"echo": job.def.payload}))
        }
    }

    /// Records execution order and peak concurrency; blocks while `gate` is shut
    struct Recording {
        order: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        gate: tokio::sync::Semaphore,
        delay: Duration,
    }

    impl Recording {
        fn new(open: bool, delay: Duration) -> Self {
            Self {
                order: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                gate: tokio::sync::Semaphore::new(if open { 1_000 } else { 0 }),
                delay,
            }
        }
    }

    #[async_trait]
    impl JobHandler for Recording {
        async fn execute(&self, job: &QueueJob) -> OrchestratorResult<Value> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_active, Ordering::SeqCst);
            let name = job.def.payload.as_str().unwrap_or_default().to_string();
            self.order.lock().unwrap().push(name.clone());

            let _permit = self.gate.acquire().await;
            tokio::time::sleep(self.delay).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(name))
        }
    }

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        async fn execute(&self, _job: &QueueJob) -> OrchestratorResult<Value> {
            Err(OrchestratorError::driver("relation does not exist"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight() {
        let queue = queue(fast_config());
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(100),
        });
        queue.register_handler("count", handler.clone());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.enqueue_or_join(request("same", "count")).await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!({"echo": "same"}));
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_errors_reach_every_waiter() {
        let queue = queue(fast_config());
        queue.register_handler("fail", Arc::new(Failing));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.enqueue_or_join(request("broken", "fail")).await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err, OrchestratorError::driver("relation does not exist"));
        }
    }

    #[tokio::test]
    async fn test_priority_order() {
        let mut config = fast_config();
        config.default_concurrency = 1;
        let queue = queue(config);
        let handler = Arc::new(Recording::new(false, Duration::ZERO));
        queue.register_handler("record", handler.clone());

        // Occupy the only slot so the next three stay queued
        let blocker = queue.enqueue(request("blocker", "record")).await.unwrap();
        let a = queue.enqueue(request("A", "record").priority(1)).await.unwrap();
        let b = queue.enqueue(request("B", "record").priority(5)).await.unwrap();
        let c = queue.enqueue(request("C", "record").priority(5)).await.unwrap();

        handler.gate.add_permits(1_000);
        for ticket in [&blocker, &a, &b, &c] {
            queue.wait(ticket, None).await.unwrap();
        }

        assert_eq!(
            *handler.order.lock().unwrap(),
            vec!["blocker", "B", "C", "A"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_cap() {
        let queue = queue(fast_config());
        let handler = Arc::new(Recording::new(true, Duration::from_millis(50)));
        queue.register_handler("record", handler.clone());

        let mut tickets = Vec::new();
        for i in 0..5 {
            tickets.push(
                queue
                    .enqueue(request(&format!("job-{}", i), "record"))
                    .await
                    .unwrap(),
            );
        }
        for ticket in &tickets {
            queue.wait(ticket, None).await.unwrap();
        }

        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
        assert_eq!(handler.order.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_continue_wait_then_rejoin() {
        let mut config = fast_config();
        config.continue_wait_timeout = Duration::from_millis(30);
        let queue = queue(config);
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        queue.register_handler("count", handler.clone());

        let err = queue
            .enqueue_or_join(request("slow", "count"))
            .await
            .unwrap_err();
        assert!(err.is_continue_wait());

        let stage = queue
            .query_stage(&QueryFingerprint::of(&"slow"))
            .await
            .unwrap();
        assert!(matches!(stage, Some(QueryStage::Executing { .. })));

        // Polling again re-attaches to the same execution
        let ticket = queue.enqueue(request("slow", "count")).await.unwrap();
        assert!(ticket.joined);
        queue.wait(&ticket, None).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_renew_cancels_waiters_of_old_job() {
        let queue = queue(fast_config());
        let handler = Arc::new(Recording::new(false, Duration::ZERO));
        queue.register_handler("record", handler.clone());

        let old = queue.enqueue(request("q", "record")).await.unwrap();
        let renewed = queue
            .enqueue(request("q", "record").force_renew(true))
            .await
            .unwrap();
        assert_ne!(old.job_id, renewed.job_id);

        let err = queue.wait(&old, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { .. }));

        handler.gate.add_permits(1_000);
        assert_eq!(queue.wait(&renewed, None).await.unwrap(), json!("q"));
    }

    #[tokio::test]
    async fn test_cancel_by_fingerprint() {
        let queue = queue(fast_config());
        let handler = Arc::new(Recording::new(false, Duration::ZERO));
        queue.register_handler("record", handler.clone());

        let ticket = queue.enqueue(request("victim", "record")).await.unwrap();
        assert!(queue.cancel(&ticket.fingerprint).await.unwrap());
        assert!(!queue.cancel(&ticket.fingerprint).await.unwrap());

        let err = queue.wait(&ticket, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_stall_recovery_keeps_waiters() {
        let store: Arc<dyn StoreDriver> = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueryQueue::new(Arc::clone(&store), fast_config()));
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        queue.register_handler("count", handler.clone());

        // A worker in another process claims the job and dies
        let job = QueueJob::new(
            QueryFingerprint::of(&"crash").as_str(),
            "default",
            0,
            QueryDef::handler("count").payload(json!("crash")),
        );
        store.add_job(job, false).await.unwrap();
        let claimed = store
            .claim_next_job("default", 2, "dead-worker")
            .await
            .unwrap()
            .unwrap();

        let ticket = queue.enqueue(request("crash", "count")).await.unwrap();
        assert!(ticket.joined);
        assert_eq!(ticket.job_id, claimed.id);

        let waiter = {
            let queue = Arc::clone(&queue);
            let ticket = ticket.clone();
            tokio::spawn(async move { queue.wait(&ticket, None).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = queue.run_maintenance().await.unwrap();
        assert_eq!(report.requeued, 1);

        assert_eq!(waiter.await.unwrap().unwrap(), json!({"echo": "crash"}));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let job = store.get_job(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.stall_count, 1);
        assert_eq!(job.attempts, 2);
        let stages: Vec<&str> = job.stage_results.iter().map(|s| s.stage.as_str()).collect();
        let requeued_at = stages.iter().position(|s| *s == "requeued after stall").unwrap();
        assert_eq!(stages[requeued_at - 1], "stalled");
        assert!(stages[requeued_at + 1].starts_with("claimed by worker-"));
    }

    #[tokio::test]
    async fn test_stall_budget_exhausted() {
        let store: Arc<dyn StoreDriver> = Arc::new(MemoryStore::new());
        let mut config = fast_config();
        config.max_stall_retries = 0;
        let queue = Arc::new(QueryQueue::new(Arc::clone(&store), config));

        let job = QueueJob::new("fp", "default", 0, QueryDef::handler("none"));
        store.add_job(job, false).await.unwrap();
        let claimed = store.claim_next_job("default", 1, "dead").await.unwrap().unwrap();
        let ticket = JobTicket {
            job_id: claimed.id,
            fingerprint: QueryFingerprint::from_hex("fp"),
            joined: true,
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = queue.run_maintenance().await.unwrap();
        assert_eq!(report.failed, 1);

        let err = queue.wait(&ticket, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Stalled { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_orphaned_jobs_are_cancelled() {
        let mut config = fast_config();
        config.orphaned_timeout = Duration::from_millis(20);
        config.default_concurrency = 1;
        let queue = queue(config);
        let handler = Arc::new(Recording::new(false, Duration::ZERO));
        queue.register_handler("record", handler.clone());

        let running = queue.enqueue(request("running", "record")).await.unwrap();
        let abandoned = queue.enqueue(request("abandoned", "record")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = queue.run_maintenance().await.unwrap();
        assert_eq!(report.orphaned, 2);

        for ticket in [&running, &abandoned] {
            let job = queue.store().get_job(ticket.job_id).await.unwrap().unwrap();
            assert_eq!(job.status(), JobStatus::Cancelled);
        }
        handler.gate.add_permits(1_000);
    }

    #[tokio::test]
    async fn test_execution_timeout() {
        let mut config = fast_config();
        config.execution_timeout = Duration::from_millis(20);
        let queue = queue(config);
        queue.register_handler(
            "count",
            Arc::new(Counting {
                calls: AtomicUsize::new(0),
                delay: Duration::from_secs(5),
            }),
        );

        let err = queue
            .enqueue_or_join(request("slow", "count"))
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::ExecutionTimeout { timeout_ms: 20 });
    }

    #[tokio::test]
    async fn test_invalid_priority_and_unknown_handler() {
        let queue = queue(fast_config());
        let err = queue
            .enqueue(request("x", "count").priority(20_000))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));

        let err = queue
            .enqueue_or_join(request("y", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_query_stage_positions() {
        let mut config = fast_config();
        config.default_concurrency = 1;
        let queue = queue(config);
        let handler = Arc::new(Recording::new(false, Duration::ZERO));
        queue.register_handler("record", handler.clone());

        let first = queue.enqueue(request("first", "record")).await.unwrap();
        let second = queue.enqueue(request("second", "record")).await.unwrap();
        let third = queue.enqueue(request("third", "record")).await.unwrap();

        let stage = |t: &JobTicket| {
            let queue = Arc::clone(&queue);
            let fp = t.fingerprint.clone();
            async move { queue.query_stage(&fp).await.unwrap() }
        };
        assert!(matches!(stage(&first).await, Some(QueryStage::Executing { .. })));
        assert_eq!(stage(&second).await, Some(QueryStage::Queued { position: 1 }));
        assert_eq!(stage(&third).await, Some(QueryStage::Queued { position: 2 }));
        assert_eq!(QueryStage::Queued { position: 2 }.to_string(), "#2 in queue");

        handler.gate.add_permits(1_000);
        queue.wait(&third, None).await.unwrap();
        assert_eq!(stage(&third).await, None);
    }
}
