//! SQLite restricted store: one database file per config key

use super::super::error::{StorageError, StorageResult};
use super::super::traits::RestrictedStore;
use super::super::types::{
    field_columns, field_values, table_name, Column, ColumnType, QueryResult, SqlValue,
    TableReset, FIXED_COLUMNS,
};
use crate::config::ConfigKey;
use crate::event::LogEvent;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column as _, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// SQLite backend for restricted metrics
pub struct SqliteStore {
    data_dir: PathBuf,
    locks: parking_lot::Mutex<HashMap<ConfigKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SqliteStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Database file backing `key`
    pub fn db_path(&self, key: ConfigKey) -> PathBuf {
        self.data_dir.join(format!("{}_{}.db", key.uid, key.id))
    }

    pub fn store_exists(&self, key: ConfigKey) -> bool {
        self.db_path(key).exists()
    }

    fn lock_for(&self, key: ConfigKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(key).or_default().clone()
    }

    async fn open(&self, key: ConfigKey) -> StorageResult<SqliteConnection> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let options = SqliteConnectOptions::new()
            .filename(self.db_path(key))
            .create_if_missing(true);
        Ok(options.connect().await?)
    }

    async fn open_existing(
        &self,
        key: ConfigKey,
        read_only: bool,
    ) -> StorageResult<Option<SqliteConnection>> {
        let path = self.db_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(read_only);
        Ok(Some(options.connect().await?))
    }

    async fn table_columns(
        conn: &mut SqliteConnection,
        table: &str,
    ) -> StorageResult<Option<Vec<Column>>> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(&mut *conn)
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows.iter().skip(FIXED_COLUMNS.len()) {
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get("type")?;
            let column_type = ColumnType::from_sql_name(&declared).ok_or_else(|| {
                StorageError::schema_mismatch(table, format!("unknown column type {}", declared))
            })?;
            columns.push(Column { name, column_type });
        }
        Ok(Some(columns))
    }

    async fn create_table(
        conn: &mut SqliteConnection,
        table: &str,
        sample: &LogEvent,
    ) -> StorageResult<()> {
        let mut definition: Vec<String> = FIXED_COLUMNS
            .iter()
            .map(|name| format!("{} INTEGER", name))
            .collect();
        definition.extend(field_columns(sample).iter().map(Column::to_string));
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) STRICT",
            table,
            definition.join(", ")
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    async fn drop_table(conn: &mut SqliteConnection, table: &str) -> StorageResult<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Writes `rows` in one transaction; any error rolls back the reset as well
    async fn write_rows(
        conn: &mut SqliteConnection,
        metric_id: i64,
        rows: &[LogEvent],
        reset: TableReset,
        create: bool,
    ) -> StorageResult<usize> {
        let table = table_name(metric_id);
        let mut tx = conn.begin().await?;
        if reset == TableReset::Always {
            Self::drop_table(&mut *tx, &table).await?;
        }
        let Some(sample) = rows.first() else {
            tx.commit().await?;
            return Ok(0);
        };

        let mut existing = Self::table_columns(&mut *tx, &table).await?;
        if reset == TableReset::IfIncompatible
            && existing
                .as_ref()
                .is_some_and(|columns| *columns != field_columns(sample))
        {
            info!("Columns of {} changed, replacing the table", table);
            Self::drop_table(&mut *tx, &table).await?;
            existing = None;
        }
        let columns = match existing {
            Some(columns) => columns,
            None if create => {
                Self::create_table(&mut *tx, &table, sample).await?;
                field_columns(sample)
            }
            None => return Err(StorageError::not_found(&table)),
        };

        for row in rows {
            if field_columns(row) != columns {
                return Err(StorageError::schema_mismatch(
                    &table,
                    format!(
                        "row at {} does not match the {} field columns of the table",
                        row.elapsed_timestamp_ns,
                        columns.len()
                    ),
                ));
            }
        }

        let names: Vec<&str> = FIXED_COLUMNS
            .iter()
            .copied()
            .chain(columns.iter().map(|c| c.name.as_str()))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );
        for row in rows {
            let mut query = sqlx::query(&sql)
                .bind(i64::from(row.atom_id))
                .bind(row.elapsed_timestamp_ns)
                .bind(row.wall_timestamp_ns);
            for value in field_values(row) {
                query = match value {
                    SqlValue::Integer(v) => query.bind(v),
                    SqlValue::Real(v) => query.bind(v),
                    SqlValue::Text(v) => query.bind(v),
                    SqlValue::Blob(v) => query.bind(v),
                    SqlValue::Null => query.bind(Option::<i64>::None),
                };
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn close(conn: SqliteConnection) {
        if let Err(e) = conn.close().await {
            debug!("Failed to close restricted store connection: {}", e);
        }
    }
}

fn check_read_only(sql: &str) -> StorageResult<&str> {
    let statement = sql.trim().trim_end_matches(';').trim_end();
    let keyword: String = statement
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    if (keyword != "SELECT" && keyword != "WITH") || statement.contains(';') {
        return Err(StorageError::read_only(sql));
    }
    Ok(statement)
}

fn cell(row: &SqliteRow, idx: usize) -> StorageResult<SqlValue> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_string();
    Ok(match type_name.as_str() {
        "INTEGER" => SqlValue::Integer(row.try_get(idx)?),
        "REAL" => SqlValue::Real(row.try_get(idx)?),
        "TEXT" => SqlValue::Text(row.try_get(idx)?),
        _ => SqlValue::Blob(row.try_get(idx)?),
    })
}

#[async_trait]
impl RestrictedStore for SqliteStore {
    async fn create_table_if_needed(
        &self,
        key: ConfigKey,
        metric_id: i64,
        sample: &LogEvent,
    ) -> StorageResult<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let mut conn = self.open(key).await?;
        let result = Self::create_table(&mut conn, &table_name(metric_id), sample).await;
        Self::close(conn).await;
        result?;
        debug!("Ensured table {} for config {}", table_name(metric_id), key);
        Ok(())
    }

    async fn is_schema_compatible(
        &self,
        key: ConfigKey,
        metric_id: i64,
        sample: &LogEvent,
    ) -> StorageResult<bool> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let Some(mut conn) = self.open_existing(key, true).await? else {
            return Ok(true);
        };
        let existing = Self::table_columns(&mut conn, &table_name(metric_id)).await;
        Self::close(conn).await;
        Ok(match existing? {
            None => true,
            Some(columns) => columns == field_columns(sample),
        })
    }

    async fn insert(
        &self,
        key: ConfigKey,
        metric_id: i64,
        rows: &[LogEvent],
    ) -> StorageResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let mut conn = self.open(key).await?;
        let result = Self::write_rows(&mut conn, metric_id, rows, TableReset::Never, false).await;
        Self::close(conn).await;
        result
    }

    async fn write_batch(
        &self,
        key: ConfigKey,
        metric_id: i64,
        rows: &[LogEvent],
        reset: TableReset,
    ) -> StorageResult<usize> {
        if rows.is_empty() && reset != TableReset::Always {
            return Ok(0);
        }
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let mut conn = self.open(key).await?;
        let result = Self::write_rows(&mut conn, metric_id, rows, reset, true).await;
        Self::close(conn).await;
        if let Ok(written) = &result {
            debug!(
                "Wrote {} rows to {} for config {}",
                written,
                table_name(metric_id),
                key
            );
        }
        result
    }

    async fn delete_table(&self, key: ConfigKey, metric_id: i64) -> StorageResult<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let Some(mut conn) = self.open_existing(key, false).await? else {
            return Ok(());
        };
        let table = table_name(metric_id);
        let result = Self::drop_table(&mut conn, &table).await;
        Self::close(conn).await;
        result?;
        info!("Dropped restricted table {} for config {}", table, key);
        Ok(())
    }

    async fn flush_ttl(&self, key: ConfigKey, cutoff_wall_ns: i64) -> StorageResult<u64> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let Some(mut conn) = self.open_existing(key, false).await? else {
            return Ok(0);
        };
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'metric_%'",
        )
        .fetch_all(&mut conn)
        .await?;

        let mut deleted = 0;
        for table in tables {
            let result = sqlx::query(&format!(
                "DELETE FROM {} WHERE wallTimestampNs <= ?",
                table
            ))
            .bind(cutoff_wall_ns)
            .execute(&mut conn)
            .await?;
            deleted += result.rows_affected();
        }
        Self::close(conn).await;
        if deleted > 0 {
            debug!("Deleted {} expired rows for config {}", deleted, key);
        }
        Ok(deleted)
    }

    async fn verify_integrity(&self, key: ConfigKey) -> StorageResult<bool> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let path = self.db_path(key);
        if !path.exists() {
            return Ok(true);
        }
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let result = match options.connect().await {
            Ok(mut conn) => {
                let lines = sqlx::query_scalar::<_, String>("PRAGMA integrity_check")
                    .fetch_all(&mut conn)
                    .await;
                Self::close(conn).await;
                lines
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(lines) => Ok(lines.len() == 1 && lines[0] == "ok"),
            Err(sqlx::Error::Database(e)) => {
                warn!("Integrity check of config {} failed: {}", key, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn query(&self, key: ConfigKey, sql: &str) -> StorageResult<QueryResult> {
        let statement = check_read_only(sql)?;
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let mut conn = self
            .open_existing(key, true)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("restricted store for {}", key)))?;
        let rows = sqlx::query(statement).fetch_all(&mut conn).await;
        Self::close(conn).await;
        let rows = rows?;

        let mut result = QueryResult::default();
        if let Some(first) = rows.first() {
            result.column_names = first
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
        }
        for row in &rows {
            let cells = (0..row.len())
                .map(|idx| cell(row, idx))
                .collect::<StorageResult<Vec<_>>>()?;
            result.rows.push(cells);
        }
        Ok(result)
    }

    async fn delete_store(&self, key: ConfigKey) -> StorageResult<()> {
        let lock = self.lock_for(key);
        {
            let _guard = lock.lock().await;
            match tokio::fs::remove_file(self.db_path(key)).await {
                Ok(()) => info!("Deleted restricted store for config {}", key),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.locks.lock().remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use tempfile::TempDir;

    fn key() -> ConfigKey {
        ConfigKey::new(1000, 7)
    }

    fn row(ts: i64) -> LogEvent {
        LogEvent::new(999, ts)
            .with_wall_time(ts * 10)
            .with_value(Value::Int(ts as i32))
            .with_value(Value::Str(format!("row{}", ts)))
    }

    #[tokio::test]
    async fn test_insert_and_query_in_order() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path());
        store.create_table_if_needed(key(), 5, &row(1)).await.unwrap();
        let written = store
            .insert(key(), 5, &[row(100), row(200), row(300)])
            .await
            .unwrap();
        assert_eq!(written, 3);
        assert!(dir.path().join("1000_7.db").exists());

        let result = store
            .query(
                key(),
                "SELECT elapsedTimestampNs, field_2 FROM metric_5 ORDER BY elapsedTimestampNs;",
            )
            .await
            .unwrap();
        assert_eq!(result.column_names, vec!["elapsedTimestampNs", "field_2"]);
        let timestamps: Vec<i64> = result.rows.iter().filter_map(|r| r[0].as_i64()).collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
        assert_eq!(result.rows[2][1], SqlValue::Text("row300".into()));
    }

    #[tokio::test]
    async fn test_query_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path());
        store.create_table_if_needed(key(), 5, &row(1)).await.unwrap();
        let err = store.query(key(), "DELETE FROM metric_5").await.unwrap_err();
        assert!(matches!(err, StorageError::ReadOnlyViolation(_)));
        let err = store
            .query(key(), "SELECT 1; DROP TABLE metric_5")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ReadOnlyViolation(_)));
    }

    #[tokio::test]
    async fn test_schema_mismatch_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path());
        store.create_table_if_needed(key(), 5, &row(1)).await.unwrap();
        let odd = LogEvent::new(999, 150).with_value(Value::Float(1.5));
        assert!(!store.is_schema_compatible(key(), 5, &odd).await.unwrap());
        assert!(store.is_schema_compatible(key(), 6, &odd).await.unwrap());

        let err = store.insert(key(), 5, &[row(100), odd]).await.unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch { .. }));
        let result = store.query(key(), "SELECT * FROM metric_5").await.unwrap();
        assert_eq!(result.row_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_ttl_deletes_old_rows() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path());
        store.create_table_if_needed(key(), -5, &row(1)).await.unwrap();
        store
            .insert(key(), -5, &[row(100), row(200), row(300)])
            .await
            .unwrap();
        // wall timestamps are 1000, 2000, 3000
        let deleted = store.flush_ttl(key(), 2000).await.unwrap();
        assert_eq!(deleted, 2);
        let result = store.query(key(), "SELECT atomId FROM metric_n5").await.unwrap();
        assert_eq!(result.rows, vec![vec![SqlValue::Integer(999)]]);
    }

    #[tokio::test]
    async fn test_integrity_and_delete_store() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path());
        assert!(store.verify_integrity(key()).await.unwrap());
        store.create_table_if_needed(key(), 5, &row(1)).await.unwrap();
        assert!(store.verify_integrity(key()).await.unwrap());

        std::fs::write(store.db_path(key()), b"definitely not a database file").unwrap();
        assert!(!store.verify_integrity(key()).await.unwrap());

        store.delete_store(key()).await.unwrap();
        assert!(!store.store_exists(key()));
        let err = store.query(key(), "SELECT 1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    async fn elapsed(store: &SqliteStore, table: &str) -> Vec<i64> {
        store
            .query(key(), &format!("SELECT elapsedTimestampNs FROM {}", table))
            .await
            .unwrap()
            .rows
            .iter()
            .filter_map(|r| r[0].as_i64())
            .collect()
    }

    #[tokio::test]
    async fn test_write_batch_keeps_rows_unless_reset_allows_it() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path());
        let odd = |ts: i64| LogEvent::new(999, ts).with_value(Value::Float(1.5));

        store
            .write_batch(key(), 5, &[row(100)], TableReset::IfIncompatible)
            .await
            .unwrap();

        let err = store
            .write_batch(key(), 5, &[odd(200)], TableReset::Never)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch { .. }));
        assert_eq!(elapsed(&store, "metric_5").await, vec![100]);

        // A rejected row rolls back the replacement of the table too
        let err = store
            .write_batch(key(), 5, &[odd(300), row(400)], TableReset::IfIncompatible)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch { .. }));
        assert_eq!(elapsed(&store, "metric_5").await, vec![100]);

        store
            .write_batch(key(), 5, &[odd(500)], TableReset::IfIncompatible)
            .await
            .unwrap();
        assert_eq!(elapsed(&store, "metric_5").await, vec![500]);

        store
            .write_batch(key(), 5, &[odd(600)], TableReset::Always)
            .await
            .unwrap();
        assert_eq!(elapsed(&store, "metric_5").await, vec![600]);
    }
}
