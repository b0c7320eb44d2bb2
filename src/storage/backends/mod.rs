//! Storage backend implementations

pub mod sqlite;

pub use sqlite::SqliteStore;
