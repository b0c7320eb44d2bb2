//! Metric activations
//!
//! Activations live in an [`ActivationStore`] owned by the compiled graph. Producers hold
//! [`ActivationKey`]s, never the activation itself, so hot reload can copy live activations
//! forward by key.

use crate::config::ActivationType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationKey {
    pub metric_id: i64,
    pub matcher_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationState {
    NotActive,
    Active,
    /// Triggered, takes effect on the next boot
    ActiveOnBoot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub activation_type: ActivationType,
    pub ttl_ns: i64,
    pub start_ns: i64,
    pub state: ActivationState,
}

impl Activation {
    pub fn new(activation_type: ActivationType, ttl_ns: i64) -> Self {
        Self {
            activation_type,
            ttl_ns,
            start_ns: 0,
            state: ActivationState::NotActive,
        }
    }

    pub fn activate(&mut self, now_ns: i64) {
        match self.activation_type {
            ActivationType::ActivateImmediately => {
                self.state = ActivationState::Active;
                self.start_ns = now_ns;
            }
            ActivationType::ActivateOnBoot => {
                if self.state != ActivationState::Active {
                    self.state = ActivationState::ActiveOnBoot;
                }
            }
        }
    }

    pub fn deactivate(&mut self) {
        self.state = ActivationState::NotActive;
    }

    /// End of the activation window; saturates for very long TTLs
    fn end_ns(&self) -> i64 {
        self.start_ns.saturating_add(self.ttl_ns)
    }

    pub fn is_active(&self, now_ns: i64) -> bool {
        self.state == ActivationState::Active && now_ns < self.end_ns()
    }

    pub fn remaining_ttl_ns(&self, now_ns: i64) -> Option<i64> {
        self.is_active(now_ns).then(|| self.end_ns() - now_ns)
    }
}

/// Persisted form of one activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub key: ActivationKey,
    pub state: ActivationState,
    pub remaining_ttl_ns: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ActivationStore {
    activations: BTreeMap<ActivationKey, Activation>,
}

impl ActivationStore {
    pub fn insert(&mut self, key: ActivationKey, activation: Activation) {
        self.activations.insert(key, activation);
    }

    pub fn get(&self, key: &ActivationKey) -> Option<&Activation> {
        self.activations.get(key)
    }

    pub fn get_mut(&mut self, key: &ActivationKey) -> Option<&mut Activation> {
        self.activations.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    pub fn any_active<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a ActivationKey>,
        now_ns: i64,
    ) -> bool {
        keys.into_iter()
            .any(|k| self.activations.get(k).is_some_and(|a| a.is_active(now_ns)))
    }

    /// Copies live state for every key present in both stores, keeping the new TTL
    pub fn carry_forward_from(&mut self, old: &ActivationStore) -> usize {
        let mut carried = 0;
        for (key, activation) in self.activations.iter_mut() {
            if let Some(previous) = old.activations.get(key) {
                activation.start_ns = previous.start_ns;
                activation.state = previous.state;
                carried += 1;
            }
        }
        carried
    }

    /// Snapshot of activations that are active or pending a boot
    pub fn snapshot(&self, now_ns: i64) -> Vec<ActivationRecord> {
        self.activations
            .iter()
            .filter_map(|(key, a)| match a.state {
                ActivationState::ActiveOnBoot => Some(ActivationRecord {
                    key: *key,
                    state: a.state,
                    remaining_ttl_ns: a.ttl_ns,
                }),
                ActivationState::Active => a.remaining_ttl_ns(now_ns).map(|remaining| {
                    ActivationRecord {
                        key: *key,
                        state: a.state,
                        remaining_ttl_ns: remaining,
                    }
                }),
                ActivationState::NotActive => None,
            })
            .collect()
    }

    /// Restores a snapshot; pending boot activations start now with their full TTL
    pub fn load(&mut self, records: &[ActivationRecord], now_ns: i64) {
        for record in records {
            let Some(activation) = self.activations.get_mut(&record.key) else {
                continue;
            };
            activation.state = ActivationState::Active;
            activation.start_ns = match record.state {
                ActivationState::ActiveOnBoot => now_ns,
                _ => now_ns
                    .saturating_add(record.remaining_ttl_ns)
                    .saturating_sub(activation.ttl_ns),
            };
        }
    }
}

/// Activation wiring of one producer, keyed by matcher index
#[derive(Debug, Clone, Default)]
pub struct ActivationWiring {
    pub on_matcher: HashMap<usize, ActivationKey>,
    pub deactivate_on_matcher: HashMap<usize, Vec<ActivationKey>>,
    pub keys: Vec<ActivationKey>,
}

impl ActivationWiring {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_active(&self, store: &ActivationStore, now_ns: i64) -> bool {
        self.keys.is_empty() || store.any_active(&self.keys, now_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: ActivationKey = ActivationKey {
        metric_id: 1,
        matcher_id: 2,
    };

    #[test]
    fn test_ttl_expiry() {
        let mut a = Activation::new(ActivationType::ActivateImmediately, 100);
        assert!(!a.is_active(0));
        a.activate(10);
        assert!(a.is_active(109));
        assert!(!a.is_active(110));
        assert_eq!(a.remaining_ttl_ns(60), Some(50));
    }

    #[test]
    fn test_huge_ttl_stays_active() {
        let ttl_ns = 10_000_000_000_i64.saturating_mul(1_000_000_000);
        let mut a = Activation::new(ActivationType::ActivateImmediately, ttl_ns);
        a.activate(1_000);
        assert!(a.is_active(2_000));
        assert_eq!(a.remaining_ttl_ns(2_000), Some(i64::MAX - 2_000));

        let mut store = ActivationStore::default();
        store.insert(KEY, a);
        let records = store.snapshot(2_000);
        let mut restored = ActivationStore::default();
        restored.insert(KEY, Activation::new(ActivationType::ActivateImmediately, ttl_ns));
        restored.load(&records, 0);
        assert!(restored.get(&KEY).unwrap().is_active(5_000));
    }

    #[test]
    fn test_on_boot_activation_is_pending() {
        let mut a = Activation::new(ActivationType::ActivateOnBoot, 100);
        a.activate(10);
        assert_eq!(a.state, ActivationState::ActiveOnBoot);
        assert!(!a.is_active(11));
    }

    #[test]
    fn test_carry_forward_keeps_remaining_ttl() {
        let mut old = ActivationStore::default();
        let mut live = Activation::new(ActivationType::ActivateImmediately, 1_000);
        live.activate(200);
        old.insert(KEY, live);

        let mut new = ActivationStore::default();
        new.insert(KEY, Activation::new(ActivationType::ActivateImmediately, 1_000));
        assert_eq!(new.carry_forward_from(&old), 1);
        assert_eq!(
            new.get(&KEY).unwrap().remaining_ttl_ns(700),
            old.get(&KEY).unwrap().remaining_ttl_ns(700)
        );
    }

    #[test]
    fn test_snapshot_and_load() {
        let mut store = ActivationStore::default();
        let mut a = Activation::new(ActivationType::ActivateImmediately, 1_000);
        a.activate(0);
        store.insert(KEY, a);
        let records = store.snapshot(400);
        assert_eq!(records[0].remaining_ttl_ns, 600);

        let mut restored = ActivationStore::default();
        restored.insert(KEY, Activation::new(ActivationType::ActivateImmediately, 1_000));
        restored.load(&records, 5_000);
        assert_eq!(restored.get(&KEY).unwrap().remaining_ttl_ns(5_000), Some(600));
    }

    #[test]
    fn test_wiring_without_activations_is_always_active() {
        let wiring = ActivationWiring::default();
        assert!(wiring.is_active(&ActivationStore::default(), 0));
    }
}
