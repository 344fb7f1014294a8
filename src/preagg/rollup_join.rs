//! Rollup joins: two pre-aggregations, each built on its own data source,
//! joined in process on shared dimension columns

use serde_json::Value;
use std::collections::HashMap;

use super::scheduler::PreAggregationScheduler;
use super::types::PreAggregationDefinition;
use crate::driver::{quote_ident, QueryResult, Row};
use crate::error::{OrchestratorError, OrchestratorResult};

impl PreAggregationScheduler {
    /// Inner join of both sides of a registered rollup join.
    ///
    /// Both sides must share a granularity and be fully built. Right side
    /// columns that clash with left side columns are prefixed with the right
    /// pre-aggregation's name.
    pub async fn rollup_join(&self, name: &str) -> OrchestratorResult<QueryResult> {
        let join = self
            .joins
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::InvalidRequest(format!("Unknown rollup join: {}", name))
            })?;

        let left = self.definition(&join.left).await?;
        let right = self.definition(&join.right).await?;
        if left.granularity != right.granularity {
            return Err(OrchestratorError::RollupJoinMismatch(format!(
                "{} is {} but {} is {}",
                left.name, left.granularity, right.name, right.granularity
            )));
        }

        let left_rows = self.read_built(&left).await?;
        let right_rows = self.read_built(&right).await?;

        for column in &join.on {
            for (def, side) in [(&left, &left_rows), (&right, &right_rows)] {
                if !side.columns.contains(column) {
                    return Err(OrchestratorError::RollupJoinMismatch(format!(
                        "Join dimension {} is missing from {}",
                        column, def.name
                    )));
                }
            }
        }

        let extra: Vec<(String, String)> = right_rows
            .columns
            .iter()
            .filter(|c| !join.on.contains(c))
            .map(|c| {
                let output = if left_rows.columns.contains(c) {
                    format!("{}__{}", right.name, c)
                } else {
                    c.clone()
                };
                (c.clone(), output)
            })
            .collect();

        let mut by_key: HashMap<String, Vec<&Row>> = HashMap::new();
        for row in &right_rows.rows {
            by_key.entry(join_key(row, &join.on)).or_default().push(row);
        }

        let mut rows = Vec::new();
        for row in &left_rows.rows {
            let Some(matches) = by_key.get(&join_key(row, &join.on)) else {
                continue;
            };
            for other in matches {
                let mut joined = row.clone();
                for (column, output) in &extra {
                    let value = other.get(column).cloned().unwrap_or(Value::Null);
                    joined.insert(output.clone(), value);
                }
                rows.push(joined);
            }
        }

        let mut columns = left_rows.columns;
        columns.extend(extra.into_iter().map(|(_, output)| output));
        Ok(QueryResult::new(columns, rows))
    }

    /// Rows of every partition of a definition; all partitions must be built
    async fn read_built(&self, def: &PreAggregationDefinition) -> OrchestratorResult<QueryResult> {
        let storage = self.drivers.get(def.storage_data_source())?;
        let mut combined = QueryResult::default();

        for partition in self.plan(&def.name).await? {
            let table = partition.target_table().ok_or_else(|| {
                OrchestratorError::RollupJoinMismatch(format!(
                    "Partition {} of {} is not built",
                    partition.table_name, def.name
                ))
            })?;
            let result = storage
                .query(&format!("SELECT * FROM {}", quote_ident(&table)), &[])
                .await?;
            if combined.columns.is_empty() {
                combined.columns = result.columns;
            }
            combined.rows.extend(result.rows);
        }
        Ok(combined)
    }
}

fn join_key(row: &Row, on: &[String]) -> String {
    let values: Vec<&Value> = on.iter().map(|c| row.get(c).unwrap_or(&Value::Null)).collect();
    serde_json::to_string(&values).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RefreshKeySpec;
    use crate::driver::{Driver, DriverRegistry, SqliteDriver};
    use crate::preagg::scheduler::tests::{orders_definition, scheduler_with, source};
    use crate::preagg::scheduler::SchedulerConfig;
    use crate::preagg::types::{BuildRangeSource, Granularity, RollupJoinDefinition};
    use serde_json::json;
    use std::sync::Arc;

    fn targets() -> Arc<SqliteDriver> {
        let driver = SqliteDriver::open_in_memory().unwrap();
        driver
            .execute_batch(
                "CREATE TABLE targets (month TEXT, status TEXT, target INTEGER, created_at TEXT);
                 INSERT INTO targets VALUES
                   ('2020-01', 'paid', 25, '2020-01-01 00:00:00'),
                   ('2020-02', 'open', 40, '2020-02-01 00:00:00'),
                   ('2020-02', 'paid', 100, '2020-02-01 00:00:00');",
            )
            .unwrap();
        Arc::new(driver)
    }

    fn definitions() -> (PreAggregationDefinition, PreAggregationDefinition) {
        let range = BuildRangeSource::Explicit {
            start: "2020-01-01".into(),
            end: "2020-03-01".into(),
        };

        let mut orders = orders_definition();
        orders.name = "orders_by_status".into();
        orders.table_name = "orders_by_status".into();
        orders.sql = "SELECT substr(created_at, 1, 7) AS month, status, SUM(amount) AS total \
                      FROM orders WHERE created_at >= ? AND created_at < ? GROUP BY 1, 2"
            .into();
        orders.build_range = range.clone();

        let mut goals = orders_definition();
        goals.name = "targets_by_status".into();
        goals.table_name = "targets_by_status".into();
        goals.data_source = "crm".into();
        goals.sql = "SELECT month, status, target AS total FROM targets \
                     WHERE created_at >= ? AND created_at < ?"
            .into();
        goals.build_range = range;
        goals.refresh_key = RefreshKeySpec::Immutable;

        (orders, goals)
    }

    async fn scheduler() -> Arc<PreAggregationScheduler> {
        let scheduler = scheduler_with(
            DriverRegistry::new()
                .with("default", source() as Arc<dyn Driver>)
                .with("crm", targets() as Arc<dyn Driver>),
            SchedulerConfig::default(),
        );
        let (orders, goals) = definitions();
        scheduler.register(orders).await.unwrap();
        scheduler.register(goals).await.unwrap();
        scheduler
            .register_rollup_join(RollupJoinDefinition {
                name: "orders_vs_targets".into(),
                left: "orders_by_status".into(),
                right: "targets_by_status".into(),
                on: vec!["month".into(), "status".into()],
            })
            .await
            .unwrap();
        scheduler
    }

    #[tokio::test]
    async fn test_rollup_join_across_data_sources() {
        let scheduler = scheduler().await;
        scheduler.refresh_definition("orders_by_status").await.unwrap();
        scheduler.refresh_definition("targets_by_status").await.unwrap();

        let mut result = scheduler.rollup_join("orders_vs_targets").await.unwrap();
        assert_eq!(
            result.columns,
            vec!["month", "status", "total", "targets_by_status__total"]
        );

        result.rows.sort_by_key(|r| join_key(r, &["month".into(), "status".into()]));
        assert_eq!(
            result.into_json(),
            json!([
                {"month": "2020-01", "status": "paid", "total": 30,
                 "targets_by_status__total": 25},
                {"month": "2020-02", "status": "open", "total": 50,
                 "targets_by_status__total": 40},
                {"month": "2020-02", "status": "paid", "total": 100,
                 "targets_by_status__total": 100}
            ])
        );
    }

    #[tokio::test]
    async fn test_unbuilt_side_is_a_mismatch() {
        let scheduler = scheduler().await;
        scheduler.refresh_definition("orders_by_status").await.unwrap();

        let err = scheduler.rollup_join("orders_vs_targets").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RollupJoinMismatch(_)));
    }

    #[tokio::test]
    async fn test_granularity_mismatch() {
        let scheduler = scheduler().await;
        let (_, mut goals) = definitions();
        goals.granularity = Granularity::Day;
        scheduler.register(goals).await.unwrap();

        let err = scheduler.rollup_join("orders_vs_targets").await.unwrap_err();
        assert!(err.to_string().contains("targets_by_status"));
        assert!(matches!(err, OrchestratorError::RollupJoinMismatch(_)));
    }
}
