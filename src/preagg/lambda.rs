//! Lambda reads: built partitions unioned with a live source query over the
//! range they do not cover yet

use serde_json::{json, Value};

use super::scheduler::PreAggregationScheduler;
use super::types::{bind_range, format_timestamp, DateRange};
use crate::cache::CachePolicy;
use crate::driver::{quote_ident, QueryResult, Row};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::queue::QueryFingerprint;
use crate::store::QueryDef;

impl PreAggregationScheduler {
    /// Rows of a `union_with_source_data` pre-aggregation within `range`.
    ///
    /// Rows come from the contiguous run of built partitions starting at
    /// `range.start`, each up to the end of the data its build covered.
    /// Everything after that is read live from the source, so the boundary is
    /// neither duplicated nor skipped.
    pub async fn lambda_query(
        &self,
        name: &str,
        range: &DateRange,
    ) -> OrchestratorResult<QueryResult> {
        let def = self.definition(name).await?;
        if !def.union_with_source_data {
            return Err(OrchestratorError::InvalidRequest(format!(
                "Pre-aggregation {} is not a lambda pre-aggregation",
                name
            )));
        }

        let storage = self.drivers.get(def.storage_data_source())?;
        let time_dimension = quote_ident(&def.time_dimension);

        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Row> = Vec::new();
        let mut covered_until = range.start;

        for partition in self.plan(name).await? {
            if partition.range.end <= range.start {
                continue;
            }
            if partition.range.start > covered_until {
                break;
            }
            let Some(table) = partition.target_table() else {
                break;
            };
            let Some(slice) = partition.range.intersect(range) else {
                break;
            };
            let built_until = partition
                .version_entry
                .as_ref()
                .and_then(|e| e.build_range_end)
                .unwrap_or(partition.range.end)
                .min(slice.end);
            if built_until <= slice.start {
                break;
            }

            let sql = format!(
                "SELECT * FROM {} WHERE {} >= ? AND {} < ?",
                quote_ident(&table),
                time_dimension,
                time_dimension
            );
            let bounds = [
                json!(format_timestamp(slice.start)),
                json!(format_timestamp(built_until)),
            ];
            let result = storage.query(&sql, &bounds).await?;
            if columns.is_empty() {
                columns = result.columns;
            }
            rows.extend(result.rows);
            covered_until = built_until;

            if covered_until >= range.end || built_until < partition.range.end {
                break;
            }
        }

        if covered_until < range.end {
            let tail = DateRange::new(covered_until, range.end)?;
            let params = bind_range(&def.params, &tail);
            let live = self
                .live_rows(&def.name, &def.data_source, &def.sql, &params, def.priority)
                .await?;
            if columns.is_empty() {
                columns = live.first().map(|r| r.keys().cloned().collect()).unwrap_or_default();
            }
            rows.extend(live);
        }

        Ok(QueryResult::new(columns, rows))
    }

    /// Run the source query through the queue without caching the result
    async fn live_rows(
        &self,
        name: &str,
        data_source: &str,
        sql: &str,
        params: &[Value],
        priority: i32,
    ) -> OrchestratorResult<Vec<Row>> {
        let context = json!({"lambda": name});
        let fingerprint = QueryFingerprint::of_query(data_source, sql, params, &context);
        let policy = CachePolicy::default()
            .force_no_cache(true)
            .continue_wait_timeout(self.config.key_query_timeout)
            .priority(priority);

        let result = self
            .cache
            .get_or_compute(&fingerprint, data_source, QueryDef::sql(sql, params.to_vec()), &policy)
            .await?;

        let rows: Vec<Row> = match result.value {
            Value::Array(values) => values
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        if rows.len() >= self.config.max_source_row_limit {
            return Err(OrchestratorError::InvalidRequest(format!(
                "The maximum number of source rows {} was reached for {}",
                self.config.max_source_row_limit, name
            )));
        }
        Ok(rows)
    }
}
