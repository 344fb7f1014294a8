//! Partition builds
//!
//! A build runs as a queue job so it gets the same deduplication, concurrency
//! limits and stall recovery as any query. The handler materializes the
//! partition, registers its version entry and drops superseded builds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::driver::{quote_ident, DriverRegistry};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::queue::JobHandler;
use crate::store::{QueueJob, StoreDriver, VersionEntry};

/// Handler name of partition builds
pub const BUILD_PARTITION_HANDLER: &str = "build_partition";

/// Job payload of a partition build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPayload {
    pub table_name: String,
    pub structure_version: String,
    pub content_version: String,
    pub sql: String,
    pub params: Vec<Value>,
    pub data_source: String,
    pub storage_data_source: String,
    /// End of the data this build covers
    pub range_end: DateTime<Utc>,
}

/// Builds partition tables either inside the source (`CREATE TABLE AS`) or
/// by downloading rows and uploading them to the storage data source
pub struct PartitionBuildHandler {
    store: Arc<dyn StoreDriver>,
    drivers: Arc<DriverRegistry>,
    keep_versions: usize,
}

impl PartitionBuildHandler {
    pub fn new(
        store: Arc<dyn StoreDriver>,
        drivers: Arc<DriverRegistry>,
        keep_versions: usize,
    ) -> Self {
        Self {
            store,
            drivers,
            keep_versions: keep_versions.max(1),
        }
    }

    async fn materialize(&self, payload: &BuildPayload, target: &str) -> OrchestratorResult<()> {
        let source = self.drivers.get(&payload.data_source)?;

        if payload.storage_data_source == payload.data_source {
            if !source.capabilities().can_create_table {
                return Err(OrchestratorError::driver(format!(
                    "Data source {} is read-only, configure an external data source for {}",
                    payload.data_source, payload.table_name
                )));
            }
            let sql = format!("CREATE TABLE {} AS {}", quote_ident(target), payload.sql);
            source.query(&sql, &payload.params).await?;
            return Ok(());
        }

        let storage = self.drivers.get(&payload.storage_data_source)?;
        let rows = if source.capabilities().streaming {
            source.stream(&payload.sql, &payload.params).await?.collect().await?
        } else {
            source.query(&payload.sql, &payload.params).await?
        };
        debug!(
            table = %target,
            rows = rows.len(),
            storage = %payload.storage_data_source,
            "Uploading partition"
        );
        storage.upload_table(target, &rows.columns, &rows.rows).await
    }

    /// Drop builds of the same structure beyond the newest `keep_versions`
    async fn collect_garbage(&self, built: &VersionEntry) -> OrchestratorResult<usize> {
        let entries = self.store.version_entries(&built.table_name).await?;
        let stale: Vec<VersionEntry> = entries
            .into_iter()
            .filter(|e| e.structure_version == built.structure_version)
            .skip(self.keep_versions)
            .collect();

        let mut dropped = 0;
        for entry in stale {
            let target = entry.target_table_name();
            match self.drivers.get(&entry.data_source) {
                Ok(driver) => {
                    if let Err(e) = driver.drop_table(&target).await {
                        warn!(
                            table = %target,
                            error = %e,
                            "Failed to drop superseded partition table"
                        );
                        continue;
                    }
                }
                Err(e) => {
                    warn!(table = %target, error = %e, "No driver for superseded partition table");
                    continue;
                }
            }
            if self.store.remove_version_entry(&entry).await? {
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}

#[async_trait]
impl JobHandler for PartitionBuildHandler {
    async fn execute(&self, job: &QueueJob) -> OrchestratorResult<Value> {
        let payload: BuildPayload = serde_json::from_value(job.def.payload.clone())?;

        let mut entry = VersionEntry::new(
            payload.table_name.as_str(),
            payload.structure_version.as_str(),
            payload.content_version.as_str(),
            payload.storage_data_source.as_str(),
        );
        // Rows later than the build start are read live by lambda queries
        entry.build_range_end = Some(payload.range_end.min(Utc::now()));
        let target = entry.target_table_name();

        self.materialize(&payload, &target).await?;
        self.store.put_version_entry(entry.clone()).await?;

        let dropped = self.collect_garbage(&entry).await?;
        info!(
            table = %target,
            data_source = %payload.data_source,
            dropped_versions = dropped,
            "Partition built"
        );

        Ok(serde_json::to_value(&entry)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, SqliteDriver};
    use crate::store::{MemoryStore, QueryDef};
    use serde_json::json;

    fn payload(content: &str, storage: &str) -> BuildPayload {
        BuildPayload {
            table_name: "orders_rollup20200101".into(),
            structure_version: "s1".into(),
            content_version: content.into(),
            sql: "SELECT id, amount FROM orders WHERE amount > ?".into(),
            params: vec![json!(0)],
            data_source: "default".into(),
            storage_data_source: storage.into(),
            range_end: Utc::now(),
        }
    }

    fn job(payload: &BuildPayload) -> QueueJob {
        QueueJob::new(
            "fp",
            "default",
            0,
            QueryDef::handler(BUILD_PARTITION_HANDLER)
                .payload(serde_json::to_value(payload).unwrap()),
        )
    }

    fn source() -> Arc<SqliteDriver> {
        let driver = SqliteDriver::open_in_memory().unwrap();
        driver
            .execute_batch(
                "CREATE TABLE orders (id INTEGER, amount INTEGER);
                 INSERT INTO orders VALUES (1, 10), (2, 0), (3, 30);",
            )
            .unwrap();
        Arc::new(driver)
    }

    #[tokio::test]
    async fn test_build_in_source() {
        let source = source();
        let store: Arc<dyn StoreDriver> = Arc::new(MemoryStore::new());
        let drivers = Arc::new(
            DriverRegistry::new().with("default", source.clone() as Arc<dyn Driver>),
        );
        let handler = PartitionBuildHandler::new(Arc::clone(&store), drivers, 2);

        let value = handler.execute(&job(&payload("c1", "default"))).await.unwrap();
        let entry: VersionEntry = serde_json::from_value(value).unwrap();

        let sql = format!(
            "SELECT COUNT(*) AS n FROM {}",
            quote_ident(&entry.target_table_name())
        );
        let rows = source
            .query(&sql, &[])
            .await
            .unwrap();
        assert_eq!(rows.scalar(), Some(&json!(2)));
        assert_eq!(store.version_entries("orders_rollup20200101").await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn test_build_into_external_storage() {
        let source = source();
        let storage = Arc::new(SqliteDriver::open_in_memory().unwrap());
        let store: Arc<dyn StoreDriver> = Arc::new(MemoryStore::new());
        let drivers = Arc::new(
            DriverRegistry::new()
                .with("default", source as Arc<dyn Driver>)
                .with("warehouse", storage.clone() as Arc<dyn Driver>),
        );
        let handler = PartitionBuildHandler::new(store, drivers, 2);

        let value = handler.execute(&job(&payload("c1", "warehouse"))).await.unwrap();
        let entry: VersionEntry = serde_json::from_value(value).unwrap();
        assert_eq!(entry.data_source, "warehouse");

        let sql = format!(
            "SELECT id FROM {} ORDER BY id",
            quote_ident(&entry.target_table_name())
        );
        let rows = storage
            .query(&sql, &[])
            .await
            .unwrap();
        assert_eq!(rows.into_json(), json!([{"id": 1}, {"id": 3}]));
    }

    #[tokio::test]
    async fn test_read_only_source_needs_external_storage() {
        let driver = SqliteDriver::open_in_memory().unwrap().read_only(true);
        let drivers = Arc::new(
            DriverRegistry::new().with("default", Arc::new(driver) as Arc<dyn Driver>),
        );
        let handler = PartitionBuildHandler::new(Arc::new(MemoryStore::new()), drivers, 2);

        let err = handler.execute(&job(&payload("c1", "default"))).await.unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn test_superseded_versions_are_dropped() {
        let source = source();
        let store: Arc<dyn StoreDriver> = Arc::new(MemoryStore::new());
        let drivers = Arc::new(
            DriverRegistry::new().with("default", source.clone() as Arc<dyn Driver>),
        );
        let handler = PartitionBuildHandler::new(Arc::clone(&store), drivers, 2);

        let mut built = Vec::new();
        for content in ["c1", "c2", "c3"] {
            let value = handler.execute(&job(&payload(content, "default"))).await.unwrap();
            built.push(serde_json::from_value::<VersionEntry>(value).unwrap());
            // Target names embed the build time in milliseconds
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let remaining = store.version_entries("orders_rollup20200101").await.unwrap();
        let contents: Vec<&str> = remaining.iter().map(|e| e.content_version.as_str()).collect();
        assert_eq!(contents, vec!["c3", "c2"]);

        let oldest = quote_ident(&built[0].target_table_name());
        assert!(source.query(&format!("SELECT * FROM {}", oldest), &[]).await.is_err());
    }
}
