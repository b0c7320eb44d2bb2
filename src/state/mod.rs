//! State registry
//!
//! Tracks the current value of every device/process state a metric slices by. State atoms
//! carry their own primary-key and exclusive-state annotations; metrics look values up through
//! state links and optionally remap them into groups.

pub mod manager;

pub use manager::{StateChange, StateTracker};

use crate::compiler::reason::{CompileResult, InvalidConfigReason, InvalidConfigReasonCode};
use crate::config::StateDef;
use crate::event::{DimensionKey, LogEvent};
use crate::hash::content_hash;
use std::collections::{BTreeSet, HashMap};

/// Value of a state that has not been reported yet
pub const STATE_UNKNOWN: i64 = -1;

#[derive(Debug, Clone)]
pub struct StateDefinition {
    pub id: i64,
    pub atom_id: i32,
    pub hash: u64,
    group_map: HashMap<i64, i64>,
}

impl StateDefinition {
    /// Maps a raw state value to its group, or passes it through
    pub fn map_value(&self, raw: i64) -> i64 {
        self.group_map.get(&raw).copied().unwrap_or(raw)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateRegistry {
    definitions: Vec<StateDefinition>,
    by_id: HashMap<i64, usize>,
    trackers: HashMap<i32, StateTracker>,
    /// Metric indices slicing by each state atom
    listeners: HashMap<i32, BTreeSet<usize>>,
}

impl StateRegistry {
    pub fn build(states: &[StateDef]) -> CompileResult<Self> {
        let mut registry = Self::default();
        for state in states {
            if registry.by_id.contains_key(&state.id) {
                return Err(InvalidConfigReason::new(InvalidConfigReasonCode::StateDuplicate)
                    .with_state(state.id));
            }
            let mut group_map = HashMap::new();
            if let Some(map) = &state.map {
                for group in &map.group {
                    for value in &group.value {
                        group_map.insert(i64::from(*value), group.group_id);
                    }
                }
            }
            registry.by_id.insert(state.id, registry.definitions.len());
            registry.definitions.push(StateDefinition {
                id: state.id,
                atom_id: state.atom_id,
                hash: content_hash(state),
                group_map,
            });
        }
        Ok(registry)
    }

    pub fn definition(&self, state_id: i64) -> Option<&StateDefinition> {
        self.by_id.get(&state_id).map(|&i| &self.definitions[i])
    }

    pub fn definitions(&self) -> &[StateDefinition] {
        &self.definitions
    }

    /// Subscribes a metric to changes of `atom_id`
    pub fn register_listener(&mut self, atom_id: i32, metric_index: usize) {
        self.trackers
            .entry(atom_id)
            .or_insert_with(|| StateTracker::new(atom_id));
        self.listeners.entry(atom_id).or_default().insert(metric_index);
    }

    pub fn listeners(&self, atom_id: i32) -> impl Iterator<Item = usize> + '_ {
        self.listeners
            .get(&atom_id)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    pub fn is_state_atom(&self, atom_id: i32) -> bool {
        self.trackers.contains_key(&atom_id)
    }

    pub fn state_atoms(&self) -> impl Iterator<Item = i32> + '_ {
        self.trackers.keys().copied()
    }

    pub fn on_event(&mut self, event: &LogEvent) -> Vec<StateChange> {
        match self.trackers.get_mut(&event.atom_id) {
            Some(tracker) => tracker.on_event(event),
            None => Vec::new(),
        }
    }

    pub fn value(&self, atom_id: i32, primary_key: &DimensionKey) -> i64 {
        self.trackers
            .get(&atom_id)
            .map(|t| t.value(primary_key))
            .unwrap_or(STATE_UNKNOWN)
    }

    /// Keeps the live values of state atoms tracked by both registries
    pub fn carry_values_from(&mut self, old: &StateRegistry) {
        for (atom_id, tracker) in self.trackers.iter_mut() {
            if let Some(previous) = old.trackers.get(atom_id) {
                *tracker = previous.clone();
            }
        }
    }
}
