//! Query cache
//!
//! [`QueryCache::get_or_compute`] serves fresh cached results and routes
//! everything else through the query queue, so recomputation keeps the
//! queue's single-flight and concurrency guarantees.

pub mod policy;
pub mod query_cache;

pub use policy::{CachePolicy, RefreshKeySpec};
pub use query_cache::{CachedResult, QueryCache, DEFAULT_KEY_RENEWAL_THRESHOLD};
