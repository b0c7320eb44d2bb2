//! Per-atom state trackers

use crate::event::{DimensionKey, FieldRef, LogEvent};
use std::collections::HashMap;

use super::STATE_UNKNOWN;

/// A state value transition for one primary key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub atom_id: i32,
    pub primary_key: DimensionKey,
    pub old_value: i64,
    pub new_value: i64,
}

/// Current state values of one state atom, keyed by primary fields
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    pub atom_id: i32,
    values: HashMap<DimensionKey, i64>,
}

impl StateTracker {
    pub fn new(atom_id: i32) -> Self {
        Self {
            atom_id,
            values: HashMap::new(),
        }
    }

    pub fn value(&self, primary_key: &DimensionKey) -> i64 {
        self.values
            .get(primary_key)
            .copied()
            .unwrap_or(STATE_UNKNOWN)
    }

    pub fn on_event(&mut self, event: &LogEvent) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if let Some(reset) = event
            .state_annotations
            .as_ref()
            .and_then(|a| a.reset_state)
        {
            let reset = i64::from(reset);
            for (key, value) in self.values.iter_mut() {
                if *value != reset {
                    changes.push(StateChange {
                        atom_id: self.atom_id,
                        primary_key: key.clone(),
                        old_value: *value,
                        new_value: reset,
                    });
                    *value = reset;
                }
            }
            return changes;
        }

        let primary: Vec<FieldRef> = event
            .primary_fields()
            .iter()
            .map(|&f| FieldRef::new(f))
            .collect();
        let key = DimensionKey::extract(event, &primary);
        let new_value = event
            .value_at(event.exclusive_state_field())
            .and_then(|v| v.as_i64())
            .unwrap_or(STATE_UNKNOWN);
        let old_value = self.value(&key);
        if old_value == new_value {
            return changes;
        }

        if new_value == STATE_UNKNOWN {
            self.values.remove(&key);
        } else {
            self.values.insert(key.clone(), new_value);
        }
        changes.push(StateChange {
            atom_id: self.atom_id,
            primary_key: key,
            old_value,
            new_value,
        });
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{StateAnnotations, Value};

    fn uid_state(uid: i32, state: i32) -> LogEvent {
        LogEvent::new(27, 1)
            .with_value(Value::Int(uid))
            .with_value(Value::Int(state))
            .with_state_annotations(StateAnnotations {
                primary_fields: vec![1],
                exclusive_state_field: Some(2),
                reset_state: None,
            })
    }

    #[test]
    fn test_tracks_values_per_primary_key() {
        let mut tracker = StateTracker::new(27);
        let changes = tracker.on_event(&uid_state(1000, 2));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_value, STATE_UNKNOWN);
        assert!(tracker.on_event(&uid_state(1000, 2)).is_empty());
        tracker.on_event(&uid_state(1001, 3));

        let key = DimensionKey::extract(&uid_state(1000, 0), &[FieldRef::new(1)]);
        assert_eq!(tracker.value(&key), 2);
    }

    #[test]
    fn test_reset_state_applies_to_all_keys() {
        let mut tracker = StateTracker::new(27);
        tracker.on_event(&uid_state(1000, 2));
        tracker.on_event(&uid_state(1001, 3));

        let reset = LogEvent::new(27, 2).with_state_annotations(StateAnnotations {
            primary_fields: vec![],
            exclusive_state_field: None,
            reset_state: Some(0),
        });
        let changes = tracker.on_event(&reset);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.new_value == 0));
    }

    #[test]
    fn test_unannotated_atom_uses_last_field() {
        let mut tracker = StateTracker::new(29);
        let screen = LogEvent::new(29, 1).with_value(Value::Int(2));
        tracker.on_event(&screen);
        assert_eq!(tracker.value(&DimensionKey::default()), 2);
    }
}
