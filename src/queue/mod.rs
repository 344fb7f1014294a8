//! Query queue
//!
//! Deduplicates concurrent requests by fingerprint, orders work by priority
//! and runs it through named [`JobHandler`]s with bounded concurrency per
//! data source.

pub mod fingerprint;
pub mod handler;
pub mod query_queue;
pub mod retry;

pub use fingerprint::{hash_hex, normalize_sql, QueryFingerprint};
pub use handler::{HandlerRegistry, JobHandler, QueryHandler, QUERY_HANDLER};
pub use query_queue::{
    EnqueueRequest, JobTicket, MaintenanceReport, QueryQueue, QueryStage, QueueConfig,
};
pub use retry::{next_retry_delay, retry_transient, RetryPolicy};
