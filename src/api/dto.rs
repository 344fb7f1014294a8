//! Data Transfer Objects
//!
//! Request and response types for the admin API endpoints.
//! These types are serialized/deserialized to/from JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::preagg::{Granularity, Partition, PreAggregationDefinition};
use crate::queue::QueryStage;
use crate::store::{QueueJob, VersionEntry};

// ============================================
// HEALTH DTOs
// ============================================

/// Full health status
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy", "degraded" or "unhealthy"
    pub status: String,
    /// Cache/queue store status
    pub store: String,
    pub store_backend: String,
    /// Status per data source
    pub data_sources: BTreeMap<String, String>,
    pub uptime_seconds: u64,
    pub version: String,
}

// ============================================
// QUEUE DTOs
// ============================================

/// Query parameters of `GET /api/v1/queue`
#[derive(Debug, Default, Deserialize)]
pub struct QueueListParams {
    pub data_source: Option<String>,
}

/// One live queue job
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueJobResponse {
    pub id: Uuid,
    pub fingerprint: String,
    pub data_source: String,
    pub priority: i32,
    pub status: String,
    pub handler: String,
    pub added_at: DateTime<Utc>,
    pub attempts: u32,
    pub stall_count: u32,
    pub persistent: bool,
}

impl From<&QueueJob> for QueueJobResponse {
    fn from(job: &QueueJob) -> Self {
        Self {
            id: job.id,
            fingerprint: job.fingerprint.clone(),
            data_source: job.data_source.clone(),
            priority: job.priority,
            status: job.status().as_str().to_string(),
            handler: job.def.handler.clone(),
            added_at: job.added_at,
            attempts: job.attempts,
            stall_count: job.stall_count,
            persistent: job.persistent,
        }
    }
}

/// Live queue jobs in dequeue order
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueListResponse {
    pub jobs: Vec<QueueJobResponse>,
    pub total: usize,
}

/// Stage of the live job for a fingerprint
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryStageResponse {
    pub fingerprint: String,
    #[serde(flatten)]
    pub stage: QueryStage,
    /// Human readable stage, e.g. "#2 in queue"
    pub description: String,
}

// ============================================
// PRE-AGGREGATION DTOs
// ============================================

/// Registered pre-aggregation
#[derive(Debug, Serialize, Deserialize)]
pub struct PreAggregationResponse {
    pub name: String,
    pub table_name: String,
    pub data_source: String,
    pub storage_data_source: String,
    pub granularity: Granularity,
    pub union_with_source_data: bool,
}

impl From<&PreAggregationDefinition> for PreAggregationResponse {
    fn from(def: &PreAggregationDefinition) -> Self {
        Self {
            name: def.name.clone(),
            table_name: def.table_name.clone(),
            data_source: def.data_source.clone(),
            storage_data_source: def.storage_data_source().to_string(),
            granularity: def.granularity,
            union_with_source_data: def.union_with_source_data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreAggregationListResponse {
    pub pre_aggregations: Vec<PreAggregationResponse>,
    pub total: usize,
}

/// Planned partition and its current build
#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionResponse {
    pub table_name: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub immutable: bool,
    pub target_table: Option<String>,
}

impl From<&Partition> for PartitionResponse {
    fn from(partition: &Partition) -> Self {
        Self {
            table_name: partition.table_name.clone(),
            range_start: partition.range.start,
            range_end: partition.range.end,
            immutable: partition.refresh_key.is_immutable(),
            target_table: partition.target_table(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionListResponse {
    pub pre_aggregation: String,
    pub partitions: Vec<PartitionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionListResponse {
    pub pre_aggregation: String,
    pub versions: Vec<VersionEntry>,
}
