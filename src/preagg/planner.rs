//! Partition planning
//!
//! Splits a build range into contiguous, non-overlapping partitions at
//! granularity boundaries. Only the newest partition (and any partition inside
//! the update window) keeps the definition's refresh key; the others are
//! closed and immutable.

use chrono::{DateTime, Utc};

use super::types::{bind_range, DateRange, Granularity, Partition, PreAggregationDefinition};
use crate::cache::RefreshKeySpec;
use crate::error::{OrchestratorError, OrchestratorResult};

/// Physical name prefix of the partition starting at `start`
pub fn partition_table_name(
    table_name: &str,
    granularity: Granularity,
    start: DateTime<Utc>,
) -> String {
    let iso = start.format("%Y-%m-%dT%H:%M:%S").to_string();
    let len = if granularity == Granularity::Hour { 13 } else { 10 };
    let suffix: String = iso
        .chars()
        .take(len)
        .filter(|c| !matches!(c, '-' | 'T' | ':'))
        .collect();
    format!("{}{}", table_name, suffix)
}

/// Granularity-aligned slices covering `range`
pub fn partition_ranges(
    range: &DateRange,
    granularity: Granularity,
    max_partitions: usize,
) -> OrchestratorResult<Vec<DateRange>> {
    let mut ranges = Vec::new();
    let mut cursor = granularity.floor(range.start);

    while cursor < range.end {
        let next = granularity.next(cursor);
        ranges.push(DateRange::new(cursor, next)?);
        if ranges.len() > max_partitions {
            return Err(OrchestratorError::BuildRange(format!(
                "Requested more than {} partitions for range {} at {} granularity",
                max_partitions, range, granularity
            )));
        }
        cursor = next;
    }

    Ok(ranges)
}

/// Plan the partitions of `def` over `build_range`
pub fn plan(
    def: &PreAggregationDefinition,
    build_range: &DateRange,
    max_partitions: usize,
) -> OrchestratorResult<Vec<Partition>> {
    let ranges = partition_ranges(build_range, def.granularity, max_partitions)?;
    let update_from = def
        .update_window_secs
        .map(|secs| build_range.end - chrono::Duration::seconds(secs as i64));
    let last = ranges.len().saturating_sub(1);

    let partitions = ranges
        .into_iter()
        .enumerate()
        .map(|(i, range)| {
            let open = i == last || update_from.map(|from| range.end > from).unwrap_or(false);
            let refresh_key = if open {
                bind_refresh_key(&def.refresh_key, &range)
            } else {
                RefreshKeySpec::Immutable
            };

            Partition {
                pre_aggregation: def.name.clone(),
                table_name: partition_table_name(&def.table_name, def.granularity, range.start),
                build_range_end: range.end.min(build_range.end),
                range,
                granularity: def.granularity,
                refresh_key,
                data_source: def.data_source.clone(),
                storage_data_source: def.storage_data_source().to_string(),
                sql: def.sql.clone(),
                params: def.params_for(&range),
                priority: def.priority,
                version_entry: None,
            }
        })
        .collect();

    Ok(partitions)
}

/// A SQL refresh key may reference the partition range too
fn bind_refresh_key(refresh_key: &RefreshKeySpec, range: &DateRange) -> RefreshKeySpec {
    match refresh_key {
        RefreshKeySpec::Sql {
            sql,
            params,
            data_source,
            every_secs,
        } => RefreshKeySpec::Sql {
            sql: sql.clone(),
            params: bind_range(params, range),
            data_source: data_source.clone(),
            every_secs: *every_secs,
        },
        other => other.clone(),
    }
}
