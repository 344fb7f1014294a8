//! Query orchestrator
//!
//! The entry point a gateway talks to. [`QueryOrchestrator::load`] answers a
//! compiled query from the cache or through the queue, and returns either the
//! rows or a `ContinueWait` signal telling the caller to poll again.
//!
//! ```rust,no_run
//! use conductor::{
//!     CachePolicy, Config, LoadRequest, LoadResponse, QueryOrchestrator, RefreshKeySpec,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = QueryOrchestrator::from_config(&Config::load_default()).await?;
//!     let _background = orchestrator.start_background();
//!
//!     let request = LoadRequest::new("SELECT status, COUNT(*) AS n FROM orders GROUP BY 1")
//!         .policy(CachePolicy::new(RefreshKeySpec::every(Duration::from_secs(60))));
//!
//!     loop {
//!         match orchestrator.load(request.clone()).await? {
//!             LoadResponse::Data { data, .. } => {
//!                 println!("{}", data);
//!                 break;
//!             }
//!             LoadResponse::ContinueWait => continue,
//!         }
//!     }
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CachePolicy, QueryCache};
use crate::config::{Config, DataSourceConfig, DataSourceKind};
use crate::driver::{Driver, DriverRegistry, SqliteDriver};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::preagg::{PreAggregationScheduler, SchedulerConfig};
use crate::queue::{QueryFingerprint, QueryHandler, QueryQueue, QueueConfig, QUERY_HANDLER};
use crate::store::{open_store, QueryDef, StoreDriver};

fn default_data_source() -> String {
    "default".to_string()
}

/// A compiled query to answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub sql: String,

    #[serde(default)]
    pub params: Vec<Value>,

    #[serde(default = "default_data_source")]
    pub data_source: String,

    /// Execution context that scopes the cache, e.g. tenant or security context
    #[serde(default)]
    pub context: Value,

    #[serde(default)]
    pub policy: CachePolicy,

    /// Supersede the running execution of this query. Send it on the first
    /// request only; polls after `ContinueWait` must not set it.
    #[serde(default)]
    pub renew_query: bool,

    /// Pre-aggregations whose table names the SQL reads
    #[serde(default)]
    pub pre_aggregations: Vec<String>,
}

impl LoadRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            data_source: default_data_source(),
            context: Value::Null,
            policy: CachePolicy::default(),
            renew_query: false,
            pre_aggregations: Vec::new(),
        }
    }

    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = data_source.into();
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn renew_query(mut self, renew: bool) -> Self {
        self.renew_query = renew;
        self
    }

    /// Skip the cache lookup; execution is still deduplicated by the queue
    pub fn force_no_cache(mut self, force: bool) -> Self {
        self.policy.force_no_cache = force;
        self
    }

    pub fn pre_aggregation(mut self, name: impl Into<String>) -> Self {
        self.pre_aggregations.push(name.into());
        self
    }
}

/// Answer to a [`LoadRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadResponse {
    Data {
        data: Value,
        last_refresh_time: DateTime<Utc>,
        from_cache: bool,
        refresh_key_value: Option<String>,
    },
    /// Still computing; send the same request again
    ContinueWait,
}

impl LoadResponse {
    pub fn is_continue_wait(&self) -> bool {
        matches!(self, LoadResponse::ContinueWait)
    }
}

/// A load request after pre-aggregation tables are substituted
struct ResolvedQuery {
    data_source: String,
    sql: String,
    fingerprint: QueryFingerprint,
}

/// Store, drivers, queue, cache and pre-aggregation scheduler wired together
pub struct QueryOrchestrator {
    store: Arc<dyn StoreDriver>,
    drivers: Arc<DriverRegistry>,
    queue: Arc<QueryQueue>,
    cache: Arc<QueryCache>,
    scheduler: Arc<PreAggregationScheduler>,
}

impl QueryOrchestrator {
    pub fn new(
        store: Arc<dyn StoreDriver>,
        drivers: Arc<DriverRegistry>,
        queue_config: QueueConfig,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self::assemble(store, drivers, queue_config, scheduler_config, None)
    }

    fn assemble(
        store: Arc<dyn StoreDriver>,
        drivers: Arc<DriverRegistry>,
        queue_config: QueueConfig,
        scheduler_config: SchedulerConfig,
        key_renewal_threshold: Option<std::time::Duration>,
    ) -> Self {
        let queue = Arc::new(QueryQueue::new(Arc::clone(&store), queue_config));
        queue.register_handler(QUERY_HANDLER, Arc::new(QueryHandler::new(Arc::clone(&drivers))));

        let mut cache = QueryCache::new(Arc::clone(&queue));
        if let Some(threshold) = key_renewal_threshold {
            cache = cache.key_renewal_threshold(threshold);
        }
        let cache = Arc::new(cache);
        let scheduler = Arc::new(PreAggregationScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&drivers),
            scheduler_config,
        ));

        Self {
            store,
            drivers,
            queue,
            cache,
            scheduler,
        }
    }

    /// Open the configured store and data sources and register the configured
    /// pre-aggregations
    pub async fn from_config(config: &Config) -> OrchestratorResult<Self> {
        let store = open_store(&config.store)?;

        let drivers = DriverRegistry::new();
        for (name, data_source) in &config.data_sources {
            drivers.register(name.as_str(), open_driver(data_source)?);
            info!(data_source = %name, "Registered data source");
        }

        let orchestrator = Self::assemble(
            store,
            Arc::new(drivers),
            config.queue_config(),
            config.scheduler_config(),
            config.key_renewal_threshold(),
        );

        for definition in &config.pre_aggregations.definitions {
            orchestrator.scheduler.register(definition.clone()).await?;
        }
        for join in &config.pre_aggregations.rollup_joins {
            orchestrator.scheduler.register_rollup_join(join.clone()).await?;
        }

        Ok(orchestrator)
    }

    pub fn store(&self) -> &Arc<dyn StoreDriver> {
        &self.store
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn queue(&self) -> &Arc<QueryQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<PreAggregationScheduler> {
        &self.scheduler
    }

    /// Fingerprint a load request is currently cached and deduplicated under
    pub async fn fingerprint(&self, request: &LoadRequest) -> OrchestratorResult<QueryFingerprint> {
        Ok(self.resolve(request).await?.fingerprint)
    }

    /// Substitute pre-aggregation tables and fingerprint the result. The
    /// rewritten SQL names the current builds, so a rebuild changes the
    /// fingerprint.
    async fn resolve(&self, request: &LoadRequest) -> OrchestratorResult<ResolvedQuery> {
        let mut data_source = request.data_source.clone();
        let mut sql = request.sql.clone();

        if !request.pre_aggregations.is_empty() {
            let (storage, rewritten) = self
                .scheduler
                .substitute_tables(&request.sql, &request.pre_aggregations)
                .await?;
            if let Some(storage) = storage {
                data_source = storage;
            }
            sql = rewritten;
        }

        let fingerprint =
            QueryFingerprint::of_query(&data_source, &sql, &request.params, &request.context);
        Ok(ResolvedQuery {
            data_source,
            sql,
            fingerprint,
        })
    }

    /// Answer a query from the cache, computing it through the queue when needed
    pub async fn load(&self, request: LoadRequest) -> OrchestratorResult<LoadResponse> {
        let ResolvedQuery {
            data_source,
            sql,
            fingerprint,
        } = self.resolve(&request).await?;
        let policy = request
            .policy
            .clone()
            .force_renew(request.policy.force_renew || request.renew_query);

        debug!(
            fingerprint = %fingerprint.short(),
            data_source = %data_source,
            renew = policy.force_renew,
            "Load request"
        );

        let def = QueryDef::sql(sql, request.params);
        match self
            .cache
            .get_or_compute(&fingerprint, &data_source, def, &policy)
            .await
        {
            Ok(result) => Ok(LoadResponse::Data {
                data: result.value,
                last_refresh_time: result.stored_at,
                from_cache: result.from_cache,
                refresh_key_value: result.refresh_key_value,
            }),
            Err(OrchestratorError::ContinueWait) => Ok(LoadResponse::ContinueWait),
            Err(e) => Err(e),
        }
    }

    /// Start queue maintenance and, unless refresh is external, the
    /// pre-aggregation refresh loop
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![Arc::clone(&self.queue).start()];
        if !self.scheduler.config().external_refresh {
            handles.push(Arc::clone(&self.scheduler).start());
        }
        handles
    }

    /// Stop background loops and release driver connections
    pub async fn shutdown(&self) {
        self.queue.stop().await;
        self.scheduler.stop().await;
        self.drivers.release_all().await;
        info!("Orchestrator stopped");
    }
}

fn open_driver(config: &DataSourceConfig) -> OrchestratorResult<Arc<dyn Driver>> {
    match config.kind {
        DataSourceKind::Sqlite => {
            let driver = match &config.path {
                Some(path) => SqliteDriver::open(path)?,
                None => SqliteDriver::open_in_memory()?,
            };
            Ok(Arc::new(driver.read_only(config.read_only)))
        }
    }
}
