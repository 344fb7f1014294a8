//! Pre-aggregation scheduler
//!
//! Keeps the registered definitions, resolves their build ranges, plans their
//! partitions and refreshes them through the query queue. A background loop
//! refreshes every definition on an interval.

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::build::{BuildPayload, PartitionBuildHandler, BUILD_PARTITION_HANDLER};
use super::planner;
use super::types::{
    timestamp_from_value, BuildRangeSource, DateRange, Partition, PreAggregationDefinition,
    RollupJoinDefinition,
};
use super::version::{content_version, structure_version};
use crate::cache::{CachePolicy, QueryCache, RefreshKeySpec};
use crate::driver::{quote_ident, DriverRegistry};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::queue::{EnqueueRequest, QueryFingerprint, QueryQueue};
use crate::store::{latest_version, QueryDef, StoreDriver, VersionEntry};

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_partitions: usize,
    pub refresh_interval: Duration,
    /// Never build in this process; only read existing builds
    pub external_refresh: bool,
    /// Builds kept per partition and structure version
    pub keep_versions: usize,
    /// Row count at which a lambda live query is rejected
    pub max_source_row_limit: usize,
    /// Continue-wait timeout of range and refresh key queries
    pub key_query_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_partitions: 10_000,
            refresh_interval: Duration::from_secs(60),
            external_refresh: false,
            keep_versions: 2,
            max_source_row_limit: 10_000,
            key_query_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of refreshing one definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub pre_aggregation: String,
    pub partitions: usize,
    /// Partitions whose current build was reused or built
    pub refreshed: Vec<VersionEntry>,
    /// Partition table name and error
    pub failed: Vec<(String, String)>,
}

/// Plans and refreshes pre-aggregation partitions
pub struct PreAggregationScheduler {
    pub(crate) cache: Arc<QueryCache>,
    pub(crate) store: Arc<dyn StoreDriver>,
    pub(crate) drivers: Arc<DriverRegistry>,
    pub(crate) config: SchedulerConfig,
    definitions: RwLock<HashMap<String, PreAggregationDefinition>>,
    pub(crate) joins: RwLock<HashMap<String, RollupJoinDefinition>>,
    running: RwLock<bool>,
}

impl PreAggregationScheduler {
    /// Create the scheduler and register the partition build handler on the
    /// cache's queue
    pub fn new(
        cache: Arc<QueryCache>,
        drivers: Arc<DriverRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let store = Arc::clone(cache.queue().store());
        cache.queue().register_handler(
            BUILD_PARTITION_HANDLER,
            Arc::new(PartitionBuildHandler::new(
                Arc::clone(&store),
                Arc::clone(&drivers),
                config.keep_versions,
            )),
        );

        Self {
            cache,
            store,
            drivers,
            config,
            definitions: RwLock::new(HashMap::new()),
            joins: RwLock::new(HashMap::new()),
            running: RwLock::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn queue(&self) -> &Arc<QueryQueue> {
        self.cache.queue()
    }

    pub async fn register(&self, definition: PreAggregationDefinition) -> OrchestratorResult<()> {
        if definition.name.is_empty() || definition.table_name.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "Pre-aggregation needs a name and a table name".to_string(),
            ));
        }
        info!(
            pre_aggregation = %definition.name,
            granularity = %definition.granularity,
            "Registered pre-aggregation"
        );
        self.definitions
            .write()
            .await
            .insert(definition.name.clone(), definition);
        Ok(())
    }

    pub async fn register_rollup_join(&self, join: RollupJoinDefinition) -> OrchestratorResult<()> {
        for side in [&join.left, &join.right] {
            self.definition(side).await?;
        }
        if join.on.is_empty() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "Rollup join {} has no join dimensions",
                join.name
            )));
        }
        self.joins.write().await.insert(join.name.clone(), join);
        Ok(())
    }

    pub async fn definition(&self, name: &str) -> OrchestratorResult<PreAggregationDefinition> {
        self.definitions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::InvalidRequest(format!("Unknown pre-aggregation: {}", name))
            })
    }

    /// Registered definitions, sorted by name
    pub async fn definitions(&self) -> Vec<PreAggregationDefinition> {
        let mut definitions: Vec<_> = self.definitions.read().await.values().cloned().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Resolve the total build range of a definition
    pub async fn build_range(
        &self,
        def: &PreAggregationDefinition,
    ) -> OrchestratorResult<DateRange> {
        match &def.build_range {
            BuildRangeSource::Explicit { start, end } => DateRange::parse(start, end)
                .map_err(|e| OrchestratorError::BuildRange(format!("{}: {}", def.name, e))),
            BuildRangeSource::Query { start_sql, end_sql } => {
                let now = Utc::now();
                let start = self.range_bound(def, start_sql).await?.unwrap_or(now);
                // The driven max is inclusive
                let end = self.range_bound(def, end_sql).await?.unwrap_or(now)
                    + chrono::Duration::milliseconds(1);
                DateRange::new(start, end.max(start + chrono::Duration::milliseconds(1)))
            }
        }
    }

    /// Run a min/max query through the cache. `None` when the source is empty.
    async fn range_bound(
        &self,
        def: &PreAggregationDefinition,
        sql: &str,
    ) -> OrchestratorResult<Option<chrono::DateTime<Utc>>> {
        let context = json!({"build_range": def.name});
        let fingerprint = QueryFingerprint::of_query(&def.data_source, sql, &[], &context);
        let policy = CachePolicy::new(RefreshKeySpec::every(self.config.refresh_interval))
            .continue_wait_timeout(self.config.key_query_timeout)
            .priority(def.priority);

        let result = self
            .cache
            .get_or_compute(&fingerprint, &def.data_source, QueryDef::sql(sql, vec![]), &policy)
            .await
            .map_err(|e| match e {
                OrchestratorError::ContinueWait => e,
                other => OrchestratorError::BuildRange(format!("{}: {}", def.name, other)),
            })?;

        let value = result
            .value
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.as_object())
            .and_then(|row| row.values().next())
            .cloned()
            .unwrap_or_default();

        if value.is_null() {
            return Ok(None);
        }
        timestamp_from_value(&value).map(Some).ok_or_else(|| {
            OrchestratorError::BuildRange(format!(
                "{}: range query returned a non-timestamp value {}",
                def.name, value
            ))
        })
    }

    /// Partitions of a definition with their latest builds attached
    pub async fn plan(&self, name: &str) -> OrchestratorResult<Vec<Partition>> {
        let def = self.definition(name).await?;
        let range = self.build_range(&def).await?;
        let mut partitions = planner::plan(&def, &range, self.config.max_partitions)?;

        for partition in &mut partitions {
            let entries = self.store.version_entries(&partition.table_name).await?;
            partition.version_entry =
                latest_version(&entries, &structure_version(partition)).cloned();
        }
        Ok(partitions)
    }

    /// Current refresh key value of a partition
    async fn partition_refresh_value(&self, partition: &Partition) -> OrchestratorResult<String> {
        match &partition.refresh_key {
            RefreshKeySpec::Immutable => Ok("immutable".to_string()),
            RefreshKeySpec::Every { every_secs } => {
                Ok((Utc::now().timestamp() / (*every_secs).max(1) as i64).to_string())
            }
            key @ RefreshKeySpec::Sql { .. } => {
                let policy = CachePolicy::new(key.clone())
                    .continue_wait_timeout(self.config.key_query_timeout)
                    .priority(partition.priority);
                self.cache
                    .refresh_key_value(&partition.data_source, key, &policy)
                    .await?
                    .ok_or_else(|| OrchestratorError::driver("Refresh key query returned no value"))
            }
        }
    }

    /// Make sure the partition's current content is built and return its
    /// version entry.
    ///
    /// An existing build with the same structure and content is reused. With
    /// external refresh the latest existing build is returned, or
    /// `PartitionNotBuilt`.
    pub async fn refresh(&self, partition: &Partition) -> OrchestratorResult<VersionEntry> {
        let structure = structure_version(partition);
        let entries = self.store.version_entries(&partition.table_name).await?;
        let latest = latest_version(&entries, &structure);

        if self.config.external_refresh {
            return latest
                .cloned()
                .ok_or_else(|| OrchestratorError::PartitionNotBuilt(partition.table_name.clone()));
        }

        let refresh_value = self.partition_refresh_value(partition).await?;
        let content = content_version(&structure, &refresh_value, &partition.range);
        if let Some(latest) = latest.filter(|e| e.content_version == content) {
            debug!(table = %partition.table_name, "Partition is up to date");
            return Ok(latest.clone());
        }

        let payload = BuildPayload {
            table_name: partition.table_name.clone(),
            structure_version: structure.clone(),
            content_version: content.clone(),
            sql: partition.sql.clone(),
            params: partition.params.clone(),
            data_source: partition.data_source.clone(),
            storage_data_source: partition.storage_data_source.clone(),
            range_end: partition.build_range_end,
        };
        let fingerprint = QueryFingerprint::of(&(
            BUILD_PARTITION_HANDLER,
            &partition.table_name,
            &structure,
            &content,
        ));
        let request = EnqueueRequest::new(
            fingerprint,
            partition.data_source.as_str(),
            QueryDef::handler(BUILD_PARTITION_HANDLER).payload(serde_json::to_value(&payload)?),
        )
        .priority(partition.priority)
        .persistent(true);

        info!(
            table = %partition.table_name,
            range = %partition.range,
            "Refreshing partition"
        );
        let ticket = self.queue().enqueue(request).await?;
        let value = self.queue().wait(&ticket, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Refresh every partition of a definition. Partitions refresh
    /// concurrently (bounded by the queue) and a failure does not stop the
    /// others.
    pub async fn refresh_definition(&self, name: &str) -> OrchestratorResult<RefreshReport> {
        let partitions = self.plan(name).await?;
        let results = join_all(partitions.iter().map(|p| self.refresh(p))).await;

        let mut report = RefreshReport {
            pre_aggregation: name.to_string(),
            partitions: partitions.len(),
            ..Default::default()
        };
        for (partition, result) in partitions.iter().zip(results) {
            match result {
                Ok(entry) => report.refreshed.push(entry),
                Err(e) => {
                    warn!(table = %partition.table_name, error = %e, "Partition refresh failed");
                    report.failed.push((partition.table_name.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    pub async fn refresh_all(&self) -> Vec<OrchestratorResult<RefreshReport>> {
        let mut reports = Vec::new();
        for def in self.definitions().await {
            reports.push(self.refresh_definition(&def.name).await);
        }
        reports
    }

    /// Build entries of every partition table of a definition, newest first
    pub async fn versions(&self, name: &str) -> OrchestratorResult<Vec<VersionEntry>> {
        let mut versions = Vec::new();
        for partition in self.plan(name).await? {
            versions.extend(self.store.version_entries(&partition.table_name).await?);
        }
        versions.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        Ok(versions)
    }

    /// Built partitions of a definition overlapping `range`, building missing
    /// ones unless refresh is external
    pub async fn built_partitions(
        &self,
        name: &str,
        range: Option<&DateRange>,
    ) -> OrchestratorResult<Vec<Partition>> {
        let mut partitions = self.plan(name).await?;
        if let Some(range) = range {
            partitions.retain(|p| p.range.intersect(range).is_some());
        }

        for partition in &mut partitions {
            if partition.version_entry.is_none() {
                partition.version_entry = Some(self.refresh(partition).await?);
            }
        }
        Ok(partitions)
    }

    /// SQL reading the whole pre-aggregation: the union of its current
    /// partition tables. Returns the data source holding them.
    pub async fn table_sql(&self, name: &str) -> OrchestratorResult<(String, String)> {
        let def = self.definition(name).await?;
        let partitions = self.built_partitions(name, None).await?;

        let selects: Vec<String> = partitions
            .iter()
            .filter_map(|p| p.target_table())
            .map(|table| format!("SELECT * FROM {}", quote_ident(&table)))
            .collect();
        if selects.is_empty() {
            return Err(OrchestratorError::PartitionNotBuilt(def.table_name));
        }
        Ok((def.storage_data_source().to_string(), selects.join(" UNION ALL ")))
    }

    /// Rewrite `sql` so references to the definitions' table names read the
    /// built partitions. All definitions must share one storage data source.
    pub async fn substitute_tables(
        &self,
        sql: &str,
        pre_aggregations: &[String],
    ) -> OrchestratorResult<(Option<String>, String)> {
        let mut storage: Option<String> = None;
        let mut ctes = Vec::new();

        for name in pre_aggregations {
            let def = self.definition(name).await?;
            let (data_source, table_sql) = self.table_sql(name).await?;
            if let Some(existing) = &storage {
                if existing != &data_source {
                    return Err(OrchestratorError::InvalidRequest(format!(
                        "Pre-aggregations {:?} live on different data sources",
                        pre_aggregations
                    )));
                }
            }
            storage = Some(data_source);
            ctes.push(format!("{} AS ({})", quote_ident(&def.table_name), table_sql));
        }

        if ctes.is_empty() {
            return Ok((None, sql.to_string()));
        }

        let trimmed = sql.trim_start();
        let with_clause = trimmed
            .get(..5)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("WITH "));
        let rewritten = if with_clause {
            format!("WITH {}, {}", ctes.join(", "), &trimmed[5..])
        } else {
            format!("WITH {} {}", ctes.join(", "), trimmed)
        };
        Ok((storage, rewritten))
    }

    /// Start the refresh loop
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self;

        tokio::spawn(async move {
            *scheduler.running.write().await = true;

            let mut interval = tokio::time::interval(scheduler.config.refresh_interval);

            loop {
                interval.tick().await;

                if !*scheduler.running.read().await {
                    break;
                }

                for report in scheduler.refresh_all().await {
                    match report {
                        Ok(report) if report.failed.is_empty() => debug!(
                            pre_aggregation = %report.pre_aggregation,
                            partitions = report.partitions,
                            "Pre-aggregation refreshed"
                        ),
                        Ok(report) => warn!(
                            pre_aggregation = %report.pre_aggregation,
                            failed = report.failed.len(),
                            "Pre-aggregation refreshed with failures"
                        ),
                        Err(e) => error!(error = %e, "Pre-aggregation refresh failed"),
                    }
                }
            }
        })
    }

    /// Stop the refresh loop
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}
