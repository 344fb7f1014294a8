//! # Conductor
//!
//! Query orchestration core for an analytics API: answers compiled SQL
//! queries through a single-flight queue and a refresh-key driven cache, and
//! keeps partitioned pre-aggregation tables built and versioned.
//!
//! ## Features
//!
//! - **Single-flight execution**: identical queries share one execution, even across processes
//! - **Refresh-key caching**: results stay valid until their refresh key changes
//! - **Continue-wait**: long queries answer "ask again" instead of holding the caller
//! - **Pre-aggregations**: time-partitioned rollups, versioned and refreshed in the background
//! - **Durable store**: in-memory or SQLite-backed queue and cache state
//!
//! ## Modules
//!
//! - [`store`]: Queue, cache and version state behind the [`StoreDriver`] contract
//! - [`driver`]: Data-source drivers the queue executes against
//! - [`queue`]: Priority queue with deduplication, heartbeats and stall recovery
//! - [`cache`]: Refresh-key cache layered over the queue
//! - [`preagg`]: Pre-aggregation planner, builder and scheduler
//! - [`orchestrator`]: The entry point tying them together
//! - [`api`]: Admin API with Axum
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conductor::{Config, LoadRequest, LoadResponse, QueryOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = QueryOrchestrator::from_config(&Config::default()).await?;
//!     let workers = orchestrator.start_background();
//!
//!     match orchestrator.load(LoadRequest::new("SELECT 1 AS one")).await? {
//!         LoadResponse::Data { data, .. } => println!("{}", data),
//!         LoadResponse::ContinueWait => println!("still running"),
//!     }
//!
//!     orchestrator.shutdown().await;
//!     for worker in workers {
//!         worker.abort();
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod preagg;
pub mod queue;
pub mod store;

pub use error::{OrchestratorError, OrchestratorResult};

pub use store::{
    open_store, MemoryStore, QueueJob, SqliteStore, StoreBackend, StoreConfig, StoreDriver,
    StoreError, VersionEntry,
};

pub use driver::{Driver, DriverCapabilities, DriverRegistry, QueryResult, SqliteDriver};

pub use queue::{QueryFingerprint, QueryQueue, QueryStage, QueueConfig, RetryPolicy};

pub use cache::{CachePolicy, QueryCache, RefreshKeySpec};

pub use preagg::{
    DateRange, Granularity, Partition, PreAggregationDefinition, PreAggregationScheduler,
    RefreshReport, RollupJoinDefinition, SchedulerConfig,
};

pub use orchestrator::{LoadRequest, LoadResponse, QueryOrchestrator};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{ApiConfig, Config, ConfigError, DataSourceConfig, LoggingConfig};
