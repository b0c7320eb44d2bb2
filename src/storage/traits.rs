//! Trait implemented by restricted metric stores

use async_trait::async_trait;

use super::error::StorageResult;
use super::types::{QueryResult, TableReset};
use crate::config::ConfigKey;
use crate::event::LogEvent;

/// Persistence for the rows of restricted metrics, one isolated store per config
#[async_trait]
pub trait RestrictedStore: Send + Sync {
    /// Creates the metric's table with columns derived from `sample`
    async fn create_table_if_needed(
        &self,
        key: ConfigKey,
        metric_id: i64,
        sample: &LogEvent,
    ) -> StorageResult<()>;

    /// A missing table counts as compatible
    async fn is_schema_compatible(
        &self,
        key: ConfigKey,
        metric_id: i64,
        sample: &LogEvent,
    ) -> StorageResult<bool>;

    /// Writes all rows in one transaction, or none of them
    async fn insert(&self, key: ConfigKey, metric_id: i64, rows: &[LogEvent])
        -> StorageResult<usize>;

    /// Applies `reset`, creates the table if needed and inserts `rows`, all under the config's
    /// lock and in one transaction. A rejected batch leaves the store untouched.
    async fn write_batch(
        &self,
        key: ConfigKey,
        metric_id: i64,
        rows: &[LogEvent],
        reset: TableReset,
    ) -> StorageResult<usize>;

    async fn delete_table(&self, key: ConfigKey, metric_id: i64) -> StorageResult<()>;

    /// Deletes rows whose wall timestamp is at or before `cutoff_wall_ns`
    async fn flush_ttl(&self, key: ConfigKey, cutoff_wall_ns: i64) -> StorageResult<u64>;

    /// Returns false when the store fails its integrity check
    async fn verify_integrity(&self, key: ConfigKey) -> StorageResult<bool>;

    /// Runs a read-only statement against the store
    async fn query(&self, key: ConfigKey, sql: &str) -> StorageResult<QueryResult>;

    /// Removes the whole store of a config
    async fn delete_store(&self, key: ConfigKey) -> StorageResult<()>;
}
