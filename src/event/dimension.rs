//! Field references and the dimension keys built from them

use super::{LogEvent, Value};
use serde::{Deserialize, Serialize};

/// Selects elements of a repeated field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Position {
    First,
    Last,
    Any,
    All,
}

/// Reference to one (1-based) field of an atom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub field: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl FieldRef {
    pub fn new(field: i32) -> Self {
        Self {
            field,
            position: None,
        }
    }

    pub fn with_position(field: i32, position: Position) -> Self {
        Self {
            field,
            position: Some(position),
        }
    }
}

/// Returns true if every reference in `sub` also appears in `sup`
pub fn is_subset(sub: &[FieldRef], sup: &[FieldRef]) -> bool {
    sub.iter().all(|f| sup.contains(f))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionValue {
    pub field: i32,
    pub value: Value,
}

/// Ordered field values keying one slice of a condition or metric
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionKey(Vec<DimensionValue>);

impl DimensionKey {
    pub fn new(values: Vec<DimensionValue>) -> Self {
        Self(values)
    }

    /// Builds the key of `event` over `fields`, in declaration order
    pub fn extract(event: &LogEvent, fields: &[FieldRef]) -> Self {
        let mut values = Vec::with_capacity(fields.len());
        for field_ref in fields {
            for value in event.resolve(field_ref) {
                values.push(DimensionValue {
                    field: field_ref.field,
                    value: value.clone(),
                });
            }
        }
        Self(values)
    }

    /// Builds a key from the event's `from` fields relabelled with the `to` field numbers
    pub fn extract_linked(event: &LogEvent, from: &[FieldRef], to: &[FieldRef]) -> Self {
        let mut values = Vec::with_capacity(from.len());
        for (src, dst) in from.iter().zip(to) {
            for value in event.resolve(src) {
                values.push(DimensionValue {
                    field: dst.field,
                    value: value.clone(),
                });
            }
        }
        Self(values)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[DimensionValue] {
        &self.0
    }

    /// True when every value of `other` is also part of this key
    pub fn contains(&self, other: &DimensionKey) -> bool {
        other.0.iter().all(|v| self.0.contains(v))
    }

    pub fn value_of(&self, field: i32) -> Option<&Value> {
        self.0.iter().find(|v| v.field == field).map(|v| &v.value)
    }
}

/// Current value of one sliced state for a metric key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateValue {
    pub atom_id: i32,
    pub value: i64,
}

/// Full key of a metric slice: dimensions in what plus sliced state values
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricDimensionKey {
    pub what: DimensionKey,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateValue>,
}

impl MetricDimensionKey {
    pub fn new(what: DimensionKey, states: Vec<StateValue>) -> Self {
        Self { what, states }
    }
}
