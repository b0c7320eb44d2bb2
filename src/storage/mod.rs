//! Restricted storage
//!
//! Rows of restricted metrics are persisted outside the in-memory report path, one isolated
//! store per config key, so they can be queried by the config's delegate, expired by TTL and
//! deleted wholesale when the config goes away or the store is corrupted.

pub mod backends;
pub mod error;
pub mod traits;
pub mod types;

pub use backends::SqliteStore;
pub use error::{StorageError, StorageResult};
pub use traits::RestrictedStore;
pub use types::{
    field_columns, table_name, Column, ColumnType, QueryResult, SqlValue, TableReset,
};
