//! Events as they arrive from the ingestion boundary
//!
//! An event is one instance of an atom: an atom id, the originating uid/pid, a monotonic and a
//! wall-clock timestamp, and a positional list of typed field values (1-based, like the atom
//! schema). Repeated fields hold a flat list of scalars.

pub mod dimension;

pub use dimension::{
    is_subset, DimensionKey, DimensionValue, FieldRef, MetricDimensionKey, Position, StateValue,
};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// A typed field value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Repeated(Vec<Value>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Long(_) => 1,
            Value::Float(_) => 2,
            Value::Bool(_) => 3,
            Value::Str(_) => 4,
            Value::Bytes(_) => 5,
            Value::Repeated(_) => 6,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Repeated(_) => "repeated",
        }
    }

    /// Integer view used by count/value/gauge aggregation and int matchers
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_repeated(&self) -> bool {
        matches!(self, Value::Repeated(_))
    }

    /// Bytes fed to the stable hash used for dimensional sampling
    pub(crate) fn canonical_bytes(&self, out: &mut Vec<u8>) {
        out.push(self.rank());
        match self {
            Value::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Long(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::Str(s) => out.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => out.extend_from_slice(b),
            Value::Repeated(items) => {
                for item in items {
                    item.canonical_bytes(out);
                }
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Repeated(a), Value::Repeated(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut bytes = Vec::new();
        self.canonical_bytes(&mut bytes);
        bytes.hash(state);
    }
}

/// Annotations describing how a state atom changes state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAnnotations {
    /// Fields that identify the owner of the state (e.g. a uid)
    #[serde(default)]
    pub primary_fields: Vec<i32>,
    /// Field holding the state value; the last field when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_state_field: Option<i32>,
    /// When set, every primary key is reset to this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_state: Option<i32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("atom id must be positive, got {0}")]
    InvalidAtomId(i32),

    #[error("field {field} of atom {atom_id} nests a repeated value")]
    NestedRepeated { atom_id: i32, field: i32 },

    #[error("negative elapsed timestamp {0}")]
    NegativeTimestamp(i64),
}

/// One discrete event delivered by the ingestion boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub atom_id: i32,
    #[serde(default)]
    pub uid: i32,
    #[serde(default)]
    pub pid: i32,
    pub elapsed_timestamp_ns: i64,
    #[serde(default)]
    pub wall_timestamp_ns: i64,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restriction_category: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_annotations: Option<StateAnnotations>,
}

impl LogEvent {
    pub fn new(atom_id: i32, elapsed_timestamp_ns: i64) -> Self {
        Self {
            atom_id,
            uid: 0,
            pid: 0,
            elapsed_timestamp_ns,
            wall_timestamp_ns: 0,
            values: Vec::new(),
            restriction_category: None,
            state_annotations: None,
        }
    }

    pub fn with_uid(mut self, uid: i32) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_wall_time(mut self, wall_timestamp_ns: i64) -> Self {
        self.wall_timestamp_ns = wall_timestamp_ns;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.values.push(value);
        self
    }

    pub fn with_restriction_category(mut self, category: i32) -> Self {
        self.restriction_category = Some(category);
        self
    }

    pub fn with_state_annotations(mut self, annotations: StateAnnotations) -> Self {
        self.state_annotations = Some(annotations);
        self
    }

    /// Checks the event is well formed before it reaches the router
    pub fn validate(&self) -> Result<(), EventError> {
        if self.atom_id <= 0 {
            return Err(EventError::InvalidAtomId(self.atom_id));
        }
        if self.elapsed_timestamp_ns < 0 {
            return Err(EventError::NegativeTimestamp(self.elapsed_timestamp_ns));
        }
        for (idx, value) in self.values.iter().enumerate() {
            if let Value::Repeated(items) = value {
                if items.iter().any(Value::is_repeated) {
                    return Err(EventError::NestedRepeated {
                        atom_id: self.atom_id,
                        field: idx as i32 + 1,
                    });
                }
            }
        }
        Ok(())
    }

    /// Field value at a 1-based position
    pub fn value_at(&self, field: i32) -> Option<&Value> {
        if field < 1 {
            return None;
        }
        self.values.get(field as usize - 1)
    }

    /// Resolves a field reference to the scalar values it selects
    pub fn resolve(&self, field_ref: &FieldRef) -> Vec<&Value> {
        match self.value_at(field_ref.field) {
            None => Vec::new(),
            Some(Value::Repeated(items)) => match field_ref.position {
                Some(Position::First) => items.first().into_iter().collect(),
                Some(Position::Last) => items.last().into_iter().collect(),
                Some(Position::All) | Some(Position::Any) => items.iter().collect(),
                None => Vec::new(),
            },
            Some(value) => vec![value],
        }
    }

    /// Field holding the exclusive state value for state atoms
    pub fn exclusive_state_field(&self) -> i32 {
        self.state_annotations
            .as_ref()
            .and_then(|a| a.exclusive_state_field)
            .unwrap_or(self.values.len() as i32)
    }

    pub fn primary_fields(&self) -> &[i32] {
        self.state_annotations
            .as_ref()
            .map(|a| a.primary_fields.as_slice())
            .unwrap_or(&[])
    }
}
