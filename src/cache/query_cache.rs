//! Query Cache
//!
//! Get-or-compute over the [`QueryQueue`]. A cached result is served while it
//! is fresh under its [`RefreshKeySpec`]; otherwise the computation is run (or
//! joined) through the queue, which writes the new entry atomically with the
//! job's completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::policy::{CachePolicy, RefreshKeySpec};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::queue::{hash_hex, EnqueueRequest, QueryFingerprint, QueryQueue};
use crate::store::{cache_key, CacheDirective, CacheEntry, QueryDef, StoreDriver};

/// How long a key query result is reused unless the key says otherwise
pub const DEFAULT_KEY_RENEWAL_THRESHOLD: Duration = Duration::from_secs(2 * 60);

/// A result returned by the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub value: Value,
    /// When the value was computed
    pub stored_at: DateTime<Utc>,
    pub refresh_key_value: Option<String>,
    /// Served from an existing entry without waiting for a computation
    pub from_cache: bool,
}

impl CachedResult {
    fn from_entry(entry: CacheEntry) -> Self {
        Self {
            value: entry.value,
            stored_at: entry.stored_at,
            refresh_key_value: entry.refresh_key_value,
            from_cache: true,
        }
    }
}

/// Get-or-compute cache keyed by query fingerprint
pub struct QueryCache {
    queue: Arc<QueryQueue>,
    store: Arc<dyn StoreDriver>,
    key_renewal_threshold: Duration,
}

impl QueryCache {
    pub fn new(queue: Arc<QueryQueue>) -> Self {
        let store = Arc::clone(queue.store());
        Self {
            queue,
            store,
            key_renewal_threshold: DEFAULT_KEY_RENEWAL_THRESHOLD,
        }
    }

    /// Builder method: reuse period of key query results without an explicit `every`
    pub fn key_renewal_threshold(mut self, threshold: Duration) -> Self {
        self.key_renewal_threshold = threshold;
        self
    }

    pub fn queue(&self) -> &Arc<QueryQueue> {
        &self.queue
    }

    /// Return the cached value for `fingerprint` or compute it with `def` on
    /// `data_source`.
    ///
    /// Returns `ContinueWait` if the computation is still running when the
    /// continue-wait timeout elapses. Calling again with the same fingerprint
    /// re-attaches to the running job.
    pub async fn get_or_compute(
        &self,
        fingerprint: &QueryFingerprint,
        data_source: &str,
        def: QueryDef,
        policy: &CachePolicy,
    ) -> OrchestratorResult<CachedResult> {
        let refresh_key_value = match self
            .refresh_key_value(data_source, &policy.refresh_key, policy)
            .await
        {
            Ok(value) => value,
            Err(e) if e.is_continue_wait() => return Err(e),
            Err(e) => {
                // An unknown key forces renewal of the main entry
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Error fetching cache key query"
                );
                None
            }
        };

        if policy.force_no_cache {
            debug!(fingerprint = %fingerprint.short(), "Force no cache");
            return self
                .compute(fingerprint, data_source, def, policy, refresh_key_value)
                .await;
        }

        let Some(entry) = self.entry(fingerprint).await? else {
            debug!(fingerprint = %fingerprint.short(), "Missing cache entry");
            return self
                .compute(fingerprint, data_source, def, policy, refresh_key_value)
                .await;
        };

        let now = Utc::now();
        if !policy.force_renew
            && !is_stale(&entry, &policy.refresh_key, refresh_key_value.as_deref(), now)
        {
            debug!(fingerprint = %fingerprint.short(), "Using cache entry");
            return Ok(CachedResult::from_entry(entry));
        }

        if !policy.wait_for_renew {
            info!(fingerprint = %fingerprint.short(), "Renewing cache entry in background");
            self.renew_in_background(fingerprint, data_source, def, policy, refresh_key_value);
            return Ok(CachedResult::from_entry(entry));
        }

        debug!(fingerprint = %fingerprint.short(), "Waiting for renew");
        match self
            .compute(fingerprint, data_source, def, policy, refresh_key_value)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) if !e.is_continue_wait() && within_grace(&entry, policy, now) => {
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Renewal failed, serving stale entry"
                );
                Ok(CachedResult::from_entry(entry))
            }
            Err(e) => Err(e),
        }
    }

    /// The cached result for a fingerprint, fresh or not, without computing
    pub async fn result_from_cache_if_exists(
        &self,
        fingerprint: &QueryFingerprint,
    ) -> OrchestratorResult<Option<CachedResult>> {
        Ok(self.entry(fingerprint).await?.map(CachedResult::from_entry))
    }

    /// When the cached result for a fingerprint was computed
    pub async fn last_refresh_time(
        &self,
        fingerprint: &QueryFingerprint,
    ) -> OrchestratorResult<Option<DateTime<Utc>>> {
        Ok(self.entry(fingerprint).await?.map(|e| e.stored_at))
    }

    /// Drop the cached result for a fingerprint
    pub async fn invalidate(&self, fingerprint: &QueryFingerprint) -> OrchestratorResult<bool> {
        Ok(self.store.delete(&cache_key(fingerprint.as_str())).await?)
    }

    /// The unexpired entry for a fingerprint
    async fn entry(
        &self,
        fingerprint: &QueryFingerprint,
    ) -> OrchestratorResult<Option<CacheEntry>> {
        let Some(raw) = self.store.get(&cache_key(fingerprint.as_str())).await? else {
            return Ok(None);
        };
        let entry: CacheEntry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Dropping unreadable cache entry"
                );
                return Ok(None);
            }
        };
        if entry.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Hash of the refresh key query result, for SQL refresh keys.
    ///
    /// The key query is cached and deduplicated like any other query, reused
    /// for its own `every` (or the key renewal threshold). `policy` supplies
    /// priority, expiration and continue-wait timeout of the key query.
    pub async fn refresh_key_value(
        &self,
        data_source: &str,
        refresh_key: &RefreshKeySpec,
        policy: &CachePolicy,
    ) -> OrchestratorResult<Option<String>> {
        let RefreshKeySpec::Sql {
            sql,
            params,
            data_source: key_source,
            every_secs,
        } = refresh_key
        else {
            return Ok(None);
        };

        let key_source = key_source.as_deref().unwrap_or(data_source);
        let reuse_for = every_secs
            .map(Duration::from_secs)
            .unwrap_or(self.key_renewal_threshold);
        let fingerprint = QueryFingerprint::of_query(
            key_source,
            sql,
            params,
            &serde_json::json!({"refresh_key": true}),
        );

        let now = Utc::now();
        if let Some(entry) = self.entry(&fingerprint).await? {
            if entry.age(now) < reuse_for {
                return Ok(Some(hash_value(&entry.value)));
            }
        }

        let key_policy = CachePolicy::new(RefreshKeySpec::every(reuse_for))
            .hard_expiration(Duration::from_secs(policy.hard_expiration_secs))
            .priority(policy.priority);
        let key_policy = CachePolicy {
            continue_wait_timeout_ms: policy.continue_wait_timeout_ms,
            ..key_policy
        };

        let result = self
            .compute(
                &fingerprint,
                key_source,
                QueryDef::sql(sql.as_str(), params.clone()),
                &key_policy,
                None,
            )
            .await?;
        Ok(Some(hash_value(&result.value)))
    }

    async fn compute(
        &self,
        fingerprint: &QueryFingerprint,
        data_source: &str,
        def: QueryDef,
        policy: &CachePolicy,
        refresh_key_value: Option<String>,
    ) -> OrchestratorResult<CachedResult> {
        let request = self.enqueue_request(
            fingerprint,
            data_source,
            def,
            policy,
            refresh_key_value.clone(),
        );
        let ticket = self.queue.enqueue(request).await?;
        let timeout = policy
            .continue_wait_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.queue.config().continue_wait_timeout);

        let value = self.queue.wait(&ticket, Some(timeout)).await?;

        let stored_at = self
            .entry(fingerprint)
            .await?
            .map(|e| e.stored_at)
            .unwrap_or_else(Utc::now);
        Ok(CachedResult {
            value,
            stored_at,
            refresh_key_value,
            from_cache: false,
        })
    }

    fn enqueue_request(
        &self,
        fingerprint: &QueryFingerprint,
        data_source: &str,
        def: QueryDef,
        policy: &CachePolicy,
        refresh_key_value: Option<String>,
    ) -> EnqueueRequest {
        let directive = CacheDirective {
            key: cache_key(fingerprint.as_str()),
            refresh_key_value,
            renewal_threshold_secs: policy.renewal_threshold_secs,
            expire_secs: policy.hard_expiration_secs,
        };
        EnqueueRequest::new(fingerprint.clone(), data_source, def)
            .priority(policy.priority)
            .force_renew(policy.force_renew)
            .cache(directive)
    }

    fn renew_in_background(
        &self,
        fingerprint: &QueryFingerprint,
        data_source: &str,
        def: QueryDef,
        policy: &CachePolicy,
        refresh_key_value: Option<String>,
    ) {
        let request =
            self.enqueue_request(fingerprint, data_source, def, policy, refresh_key_value);
        let queue = Arc::clone(&self.queue);
        let short = fingerprint.short().to_string();

        tokio::spawn(async move {
            let result = match queue.enqueue(request).await {
                Ok(ticket) => queue.wait(&ticket, None).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(fingerprint = %short, error = %e, "Error renewing cache entry");
            }
        });
    }
}

/// Whether an unexpired entry must be recomputed
fn is_stale(
    entry: &CacheEntry,
    refresh_key: &RefreshKeySpec,
    refresh_key_value: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    match refresh_key {
        RefreshKeySpec::Immutable => false,
        RefreshKeySpec::Every { every_secs } => entry.age(now) >= Duration::from_secs(*every_secs),
        RefreshKeySpec::Sql { .. } => match refresh_key_value {
            Some(current) => entry.refresh_key_value.as_deref() != Some(current),
            None => true,
        },
    }
}

/// Whether a stale entry may still be served after a failed renewal
fn within_grace(entry: &CacheEntry, policy: &CachePolicy, now: DateTime<Utc>) -> bool {
    match policy.renewal_threshold_secs {
        Some(secs) => entry.age(now) < Duration::from_secs(secs),
        None => false,
    }
}

fn hash_value(value: &Value) -> String {
    hash_hex(&serde_json::to_vec(value).unwrap_or_default())
}
