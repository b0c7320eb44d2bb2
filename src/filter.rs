//! Atom-interest filter consulted by the ingestion boundary
//!
//! Each consumer (an installed config or the shell subscription set) registers the atom ids it
//! cares about. The ingestion side asks [`LogEventFilter::is_atom_in_use`] before fully parsing
//! an event. Dropping an atom here only saves work; disabling the filter never changes results.

use crate::config::ConfigKey;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerId {
    Config(ConfigKey),
    Shell,
}

#[derive(Debug, Default)]
struct FilterState {
    consumers: HashMap<ConsumerId, BTreeSet<i32>>,
    in_use: HashSet<i32>,
}

impl FilterState {
    fn rebuild(&mut self) {
        self.in_use = self.consumers.values().flatten().copied().collect();
    }
}

#[derive(Debug)]
pub struct LogEventFilter {
    enabled: AtomicBool,
    state: RwLock<FilterState>,
}

impl Default for LogEventFilter {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LogEventFilter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            state: RwLock::new(FilterState::default()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Replaces the atom set of `consumer`; an empty set unregisters it
    pub fn set_atom_ids(&self, consumer: ConsumerId, atom_ids: BTreeSet<i32>) {
        let mut state = self.state.write();
        if atom_ids.is_empty() {
            state.consumers.remove(&consumer);
        } else {
            state.consumers.insert(consumer, atom_ids);
        }
        state.rebuild();
        tracing::debug!(
            "Atom filter now tracks {} atoms for {} consumers",
            state.in_use.len(),
            state.consumers.len()
        );
    }

    pub fn remove_consumer(&self, consumer: ConsumerId) {
        self.set_atom_ids(consumer, BTreeSet::new());
    }

    pub fn is_atom_in_use(&self, atom_id: i32) -> bool {
        !self.is_enabled() || self.state.read().in_use.contains(&atom_id)
    }

    /// Union of every registered consumer's atoms
    pub fn atom_ids(&self) -> BTreeSet<i32> {
        self.state.read().in_use.iter().copied().collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.read().consumers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_disabled_filter_accepts_everything() {
        let filter = LogEventFilter::new(false);
        assert!(filter.is_atom_in_use(42));
        filter.set_enabled(true);
        assert!(!filter.is_atom_in_use(42));
    }

    #[test]
    fn test_empty_set_unregisters_consumer() {
        let filter = LogEventFilter::default();
        let key = ConsumerId::Config(ConfigKey::new(0, 1));
        filter.set_atom_ids(key, BTreeSet::from([1, 2]));
        filter.set_atom_ids(ConsumerId::Shell, BTreeSet::from([2, 3]));
        assert_eq!(filter.atom_ids(), BTreeSet::from([1, 2, 3]));

        filter.set_atom_ids(key, BTreeSet::new());
        assert_eq!(filter.consumer_count(), 1);
        assert!(!filter.is_atom_in_use(1));
        assert!(filter.is_atom_in_use(2));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, BTreeSet<i32>),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, prop::collection::btree_set(0i32..20, 0..5)).prop_map(|(c, s)| Op::Set(c, s)),
            (0u8..4).prop_map(Op::Remove),
        ]
    }

    fn consumer(n: u8) -> ConsumerId {
        if n == 0 {
            ConsumerId::Shell
        } else {
            ConsumerId::Config(ConfigKey::new(0, i64::from(n)))
        }
    }

    proptest! {
        #[test]
        fn prop_filter_is_union_of_registered_consumers(ops in prop::collection::vec(op(), 0..30)) {
            let filter = LogEventFilter::default();
            let mut model: HashMap<ConsumerId, BTreeSet<i32>> = HashMap::new();
            for op in ops {
                match op {
                    Op::Set(c, atoms) => {
                        filter.set_atom_ids(consumer(c), atoms.clone());
                        if atoms.is_empty() {
                            model.remove(&consumer(c));
                        } else {
                            model.insert(consumer(c), atoms);
                        }
                    }
                    Op::Remove(c) => {
                        filter.remove_consumer(consumer(c));
                        model.remove(&consumer(c));
                    }
                }
            }
            let expected: BTreeSet<i32> = model.values().flatten().copied().collect();
            prop_assert_eq!(filter.atom_ids(), expected);
            prop_assert_eq!(filter.consumer_count(), model.len());
        }
    }
}
