//! Pre-aggregations
//!
//! A pre-aggregation is a materialized rollup split into time partitions.
//! The planner slices the build range, the scheduler refreshes each partition
//! through the query queue, and readers substitute the built partition tables
//! for the logical table name. Lambda pre-aggregations union the built
//! partitions with live source rows; rollup joins combine two pre-aggregations
//! that live on different data sources.

pub mod build;
mod lambda;
pub mod planner;
mod rollup_join;
pub mod scheduler;
pub mod types;
pub mod version;

pub use build::{BuildPayload, PartitionBuildHandler, BUILD_PARTITION_HANDLER};
pub use planner::{partition_ranges, partition_table_name, plan};
pub use scheduler::{PreAggregationScheduler, RefreshReport, SchedulerConfig};
pub use types::{
    bind_range, format_timestamp, parse_timestamp, timestamp_from_value, BuildRangeSource,
    DateRange, Granularity, Partition, PreAggregationDefinition, RollupJoinDefinition,
    FROM_PARTITION_RANGE, TIMESTAMP_FORMAT, TO_PARTITION_RANGE,
};
pub use version::{content_version, structure_version, version_hash};
