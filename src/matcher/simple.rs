use crate::config::{FieldValueMatcher, SimpleAtomMatcher, ValueMatcher};
use crate::event::{FieldRef, LogEvent, Position, Value};

pub fn matches_simple(matcher: &SimpleAtomMatcher, event: &LogEvent) -> bool {
    event.atom_id == matcher.atom_id
        && matcher
            .field_value_matcher
            .iter()
            .all(|fvm| matches_field(fvm, event))
}

fn matches_field(matcher: &FieldValueMatcher, event: &LogEvent) -> bool {
    let Some(raw) = event.value_at(matcher.field) else {
        return false;
    };
    match raw {
        Value::Repeated(items) => match matcher.position {
            Some(Position::All) => {
                !items.is_empty() && items.iter().all(|v| matches_value(&matcher.value, v))
            }
            Some(Position::Any) => items.iter().any(|v| matches_value(&matcher.value, v)),
            Some(_) => {
                let field_ref = FieldRef {
                    field: matcher.field,
                    position: matcher.position,
                };
                event
                    .resolve(&field_ref)
                    .first()
                    .is_some_and(|v| matches_value(&matcher.value, v))
            }
            None => false,
        },
        scalar => matches_value(&matcher.value, scalar),
    }
}

fn matches_value(matcher: &ValueMatcher, value: &Value) -> bool {
    match matcher {
        ValueMatcher::EqBool(expected) => match value {
            Value::Bool(b) => b == expected,
            Value::Int(i) => (*i != 0) == *expected,
            _ => false,
        },
        ValueMatcher::EqString(expected) => value.as_str() == Some(expected.as_str()),
        ValueMatcher::EqAnyString(options) => value
            .as_str()
            .is_some_and(|s| options.iter().any(|o| o == s)),
        ValueMatcher::NeqAnyString(options) => value
            .as_str()
            .is_some_and(|s| options.iter().all(|o| o != s)),
        ValueMatcher::EqInt(expected) => int_of(value) == Some(*expected),
        ValueMatcher::LtInt(bound) => int_of(value).is_some_and(|v| v < *bound),
        ValueMatcher::GtInt(bound) => int_of(value).is_some_and(|v| v > *bound),
        ValueMatcher::LteInt(bound) => int_of(value).is_some_and(|v| v <= *bound),
        ValueMatcher::GteInt(bound) => int_of(value).is_some_and(|v| v >= *bound),
        ValueMatcher::EqAnyInt(options) => int_of(value).is_some_and(|v| options.contains(&v)),
        ValueMatcher::NeqAnyInt(options) => int_of(value).is_some_and(|v| !options.contains(&v)),
        ValueMatcher::LtFloat(bound) => float_of(value).is_some_and(|v| v < *bound),
        ValueMatcher::GtFloat(bound) => float_of(value).is_some_and(|v| v > *bound),
    }
}

fn int_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(i64::from(*v)),
        Value::Long(v) => Some(*v),
        _ => None,
    }
}

fn float_of(value: &Value) -> Option<f64> {
    match value {
        Value::Float(v) => Some(f64::from(*v)),
        _ => None,
    }
}
