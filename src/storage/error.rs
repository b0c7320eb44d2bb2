//! Error types for the restricted storage layer

use std::fmt;
use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Rows do not fit the columns of the existing table
    #[error("Schema mismatch on {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    /// A query tried to do more than read
    #[error("Only SELECT or WITH statements may be queried: {0}")]
    ReadOnlyViolation(String),

    /// Store or table not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The database file failed its integrity check
    #[error("Corrupted store: {0}")]
    Corrupted(String),
}

impl StorageError {
    /// Create a database error
    pub fn database<E: fmt::Display>(err: E) -> Self {
        Self::Database(err.to_string())
    }

    /// Create a schema mismatch error
    pub fn schema_mismatch<T: fmt::Display, D: fmt::Display>(table: T, detail: D) -> Self {
        Self::SchemaMismatch {
            table: table.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Create a read-only violation error
    pub fn read_only<E: fmt::Display>(statement: E) -> Self {
        Self::ReadOnlyViolation(statement.to_string())
    }

    /// Create a not found error
    pub fn not_found<E: fmt::Display>(item: E) -> Self {
        Self::NotFound(item.to_string())
    }

    /// Create a corruption error
    pub fn corrupted<E: fmt::Display>(msg: E) -> Self {
        Self::Corrupted(msg.to_string())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Database(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("row"),
            sqlx::Error::Io(io) => Self::Io(io),
            other => Self::database(other),
        }
    }
}
