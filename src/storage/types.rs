//! Type definitions for the restricted storage layer

use crate::event::{LogEvent, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Columns every restricted table starts with
pub const FIXED_COLUMNS: [&str; 3] = ["atomId", "elapsedTimestampNs", "wallTimestampNs"];

/// SQLite storage class of a field column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    pub fn from_sql_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" => Some(ColumnType::Integer),
            "REAL" => Some(ColumnType::Real),
            "TEXT" => Some(ColumnType::Text),
            _ => None,
        }
    }

    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Int(_) | Value::Long(_) | Value::Bool(_) => Some(ColumnType::Integer),
            Value::Float(_) => Some(ColumnType::Real),
            Value::Str(_) => Some(ColumnType::Text),
            Value::Bytes(_) | Value::Repeated(_) => None,
        }
    }
}

/// A field column of a restricted table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.column_type.sql_name())
    }
}

/// Field columns derived from an event; repeated and byte fields are not stored
pub fn field_columns(event: &LogEvent) -> Vec<Column> {
    event
        .values
        .iter()
        .enumerate()
        .filter_map(|(idx, value)| {
            ColumnType::of(value).map(|column_type| Column {
                name: format!("field_{}", idx + 1),
                column_type,
            })
        })
        .collect()
}

/// Field values in column order, matching [`field_columns`]
pub fn field_values(event: &LogEvent) -> Vec<SqlValue> {
    event
        .values
        .iter()
        .filter_map(|value| match value {
            Value::Int(v) => Some(SqlValue::Integer(i64::from(*v))),
            Value::Long(v) => Some(SqlValue::Integer(*v)),
            Value::Bool(v) => Some(SqlValue::Integer(i64::from(*v))),
            Value::Float(v) => Some(SqlValue::Real(f64::from(*v))),
            Value::Str(v) => Some(SqlValue::Text(v.clone())),
            Value::Bytes(_) | Value::Repeated(_) => None,
        })
        .collect()
}

/// Table holding the rows of one restricted metric
pub fn table_name(metric_id: i64) -> String {
    if metric_id < 0 {
        format!("metric_n{}", metric_id.unsigned_abs())
    } else {
        format!("metric_{}", metric_id)
    }
}

/// How a batch write treats the metric's existing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableReset {
    /// Rows must match the existing table
    Never,
    /// Replace the table when its columns differ from the batch
    IfIncompatible,
    /// Drop the table before writing
    Always,
}

/// A typed cell of a query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

/// Rows returned by a restricted query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
