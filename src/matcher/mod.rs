//! Matcher trackers
//!
//! A matcher decides whether one event qualifies. Simple matchers test the atom id and field
//! constraints; combination matchers fold their children with a logical operation. Children are
//! referenced by index into the compiled matcher vector.

mod simple;

pub use simple::matches_simple;

use crate::compiler::reason::{CompileResult, InvalidConfigReason, InvalidConfigReasonCode};
use crate::config::{AtomMatcher, LogicalOperation, SimpleAtomMatcher};
use crate::event::LogEvent;
use crate::hash::content_hash;
use std::collections::{BTreeSet, HashMap};

/// Per-event memo of matcher results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingState {
    NotComputed,
    Matched,
    NotMatched,
}

#[derive(Debug, Clone)]
pub enum MatcherKind {
    Simple(SimpleAtomMatcher),
    Combination {
        operation: LogicalOperation,
        child_ids: Vec<i64>,
        children: Vec<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct MatcherTracker {
    pub id: i64,
    pub index: usize,
    pub hash: u64,
    /// Atom ids this matcher can possibly match
    pub atom_ids: BTreeSet<i32>,
    pub kind: MatcherKind,
    initialized: bool,
}

impl MatcherTracker {
    /// Builds an uninitialized tracker; combination children are resolved by [`init_matchers`]
    pub fn create(config: &AtomMatcher, index: usize) -> CompileResult<Self> {
        let kind = match (&config.simple_atom_matcher, &config.combination) {
            (Some(simple), None) => MatcherKind::Simple(simple.clone()),
            (None, Some(combination)) => {
                if combination.matcher.is_empty() {
                    return Err(InvalidConfigReason::matcher(
                        InvalidConfigReasonCode::MatcherNoChildren,
                        config.id,
                    ));
                }
                if combination.operation == LogicalOperation::Not
                    && combination.matcher.len() != 1
                {
                    return Err(InvalidConfigReason::matcher(
                        InvalidConfigReasonCode::MatcherNotOperationIsNotUnary,
                        config.id,
                    ));
                }
                MatcherKind::Combination {
                    operation: combination.operation,
                    child_ids: combination.matcher.clone(),
                    children: Vec::new(),
                }
            }
            _ => {
                return Err(InvalidConfigReason::matcher(
                    InvalidConfigReasonCode::MatcherMalformedContentsCase,
                    config.id,
                ))
            }
        };

        let mut atom_ids = BTreeSet::new();
        if let MatcherKind::Simple(simple) = &kind {
            atom_ids.insert(simple.atom_id);
        }

        Ok(Self {
            id: config.id,
            index,
            hash: content_hash(config),
            atom_ids,
            kind,
            initialized: false,
        })
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.kind, MatcherKind::Simple(_))
    }

    pub fn children(&self) -> &[usize] {
        match &self.kind {
            MatcherKind::Simple(_) => &[],
            MatcherKind::Combination { children, .. } => children,
        }
    }
}

/// Resolves combination children depth first, rejecting dangling ids and cycles
pub fn init_matchers(
    trackers: &mut [MatcherTracker],
    id_map: &HashMap<i64, usize>,
) -> CompileResult<()> {
    let mut on_stack = vec![false; trackers.len()];
    for index in 0..trackers.len() {
        init_one(trackers, id_map, index, &mut on_stack).map_err(|e| e.reverse_ids())?;
    }
    Ok(())
}

fn init_one(
    trackers: &mut [MatcherTracker],
    id_map: &HashMap<i64, usize>,
    index: usize,
    on_stack: &mut [bool],
) -> CompileResult<()> {
    if trackers[index].initialized {
        return Ok(());
    }
    let child_ids = match &trackers[index].kind {
        MatcherKind::Simple(_) => {
            trackers[index].initialized = true;
            return Ok(());
        }
        MatcherKind::Combination { child_ids, .. } => child_ids.clone(),
    };

    on_stack[index] = true;
    let mut children = Vec::with_capacity(child_ids.len());
    let mut atom_ids = BTreeSet::new();
    for child_id in child_ids {
        let Some(&child) = id_map.get(&child_id) else {
            return Err(InvalidConfigReason::matcher(
                InvalidConfigReasonCode::MatcherChildNotFound,
                child_id,
            )
            .with_matcher(trackers[index].id));
        };
        if on_stack[child] {
            return Err(InvalidConfigReason::matcher(
                InvalidConfigReasonCode::MatcherCycle,
                child_id,
            )
            .with_matcher(trackers[index].id));
        }
        if let Err(reason) = init_one(trackers, id_map, child, on_stack) {
            return Err(reason.with_matcher(trackers[index].id));
        }
        atom_ids.extend(trackers[child].atom_ids.iter().copied());
        children.push(child);
    }
    on_stack[index] = false;

    let tracker = &mut trackers[index];
    if let MatcherKind::Combination {
        children: resolved, ..
    } = &mut tracker.kind
    {
        *resolved = children;
    }
    tracker.atom_ids = atom_ids;
    tracker.initialized = true;
    Ok(())
}

/// Evaluates matcher `index` against `event`, memoizing into `cache`
pub fn evaluate(
    trackers: &[MatcherTracker],
    index: usize,
    event: &LogEvent,
    cache: &mut [MatchingState],
) -> bool {
    match cache[index] {
        MatchingState::Matched => return true,
        MatchingState::NotMatched => return false,
        MatchingState::NotComputed => {}
    }

    let tracker = &trackers[index];
    let matched = if !tracker.atom_ids.contains(&event.atom_id) {
        false
    } else {
        match &tracker.kind {
            MatcherKind::Simple(simple) => matches_simple(simple, event),
            MatcherKind::Combination {
                operation,
                children,
                ..
            } => {
                let mut results = Vec::with_capacity(children.len());
                for &child in children {
                    results.push(evaluate(trackers, child, event, cache));
                }
                combine(*operation, &results)
            }
        }
    };

    cache[index] = if matched {
        MatchingState::Matched
    } else {
        MatchingState::NotMatched
    };
    matched
}

pub fn combine(operation: LogicalOperation, results: &[bool]) -> bool {
    match operation {
        LogicalOperation::And => results.iter().all(|r| *r),
        LogicalOperation::Or => results.iter().any(|r| *r),
        LogicalOperation::Not => !results.first().copied().unwrap_or(false),
        LogicalOperation::Nand => !results.iter().all(|r| *r),
        LogicalOperation::Nor => !results.iter().any(|r| *r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldValueMatcher, ValueMatcher};
    use crate::event::Value;
    use proptest::prelude::*;

    fn simple(id: i64, atom_id: i32) -> AtomMatcher {
        AtomMatcher::simple(id, SimpleAtomMatcher::new(atom_id))
    }

    fn build(configs: &[AtomMatcher]) -> CompileResult<Vec<MatcherTracker>> {
        let mut trackers = Vec::new();
        let mut id_map = HashMap::new();
        for (index, config) in configs.iter().enumerate() {
            trackers.push(MatcherTracker::create(config, index)?);
            id_map.insert(config.id, index);
        }
        init_matchers(&mut trackers, &id_map)?;
        Ok(trackers)
    }

    #[test]
    fn test_combination_collects_atom_ids() {
        let trackers = build(&[
            simple(1, 10),
            simple(2, 20),
            AtomMatcher::combination(3, LogicalOperation::Or, vec![1, 2]),
        ])
        .unwrap();
        assert_eq!(trackers[2].atom_ids, BTreeSet::from([10, 20]));
        assert_eq!(trackers[2].children(), &[0, 1]);
    }

    #[test]
    fn test_cycle_is_rejected_with_path() {
        let err = build(&[
            AtomMatcher::combination(1, LogicalOperation::And, vec![2]),
            AtomMatcher::combination(2, LogicalOperation::Or, vec![3]),
            AtomMatcher::combination(3, LogicalOperation::Or, vec![1]),
        ])
        .unwrap_err();
        assert_eq!(err.code, InvalidConfigReasonCode::MatcherCycle);
        assert_eq!(err.matcher_ids, vec![1, 2, 3, 1]);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = build(&[AtomMatcher::combination(5, LogicalOperation::Not, vec![5])])
            .unwrap_err();
        assert_eq!(err.code, InvalidConfigReasonCode::MatcherCycle);
    }

    #[test]
    fn test_missing_child() {
        let err = build(&[AtomMatcher::combination(1, LogicalOperation::And, vec![9])])
            .unwrap_err();
        assert_eq!(err.code, InvalidConfigReasonCode::MatcherChildNotFound);
        assert_eq!(err.matcher_ids, vec![1, 9]);
    }

    #[test]
    fn test_not_must_be_unary() {
        let err = build(&[
            simple(1, 10),
            simple(2, 20),
            AtomMatcher::combination(3, LogicalOperation::Not, vec![1, 2]),
        ])
        .unwrap_err();
        assert_eq!(err.code, InvalidConfigReasonCode::MatcherNotOperationIsNotUnary);
    }

    #[test]
    fn test_malformed_contents() {
        let config = AtomMatcher {
            id: 4,
            simple_atom_matcher: None,
            combination: None,
        };
        let err = MatcherTracker::create(&config, 0).unwrap_err();
        assert_eq!(err.code, InvalidConfigReasonCode::MatcherMalformedContentsCase);
    }

    #[test]
    fn test_evaluate_combinations() {
        let mut screen_on = SimpleAtomMatcher::new(10);
        screen_on.field_value_matcher.push(FieldValueMatcher {
            field: 1,
            position: None,
            value: ValueMatcher::EqInt(2),
        });
        let trackers = build(&[
            AtomMatcher::simple(1, screen_on),
            simple(2, 10),
            AtomMatcher::combination(3, LogicalOperation::Nand, vec![1, 2]),
            AtomMatcher::combination(4, LogicalOperation::Not, vec![1]),
        ])
        .unwrap();

        let on = LogEvent::new(10, 1).with_value(Value::Int(2));
        let mut cache = vec![MatchingState::NotComputed; trackers.len()];
        assert!(evaluate(&trackers, 0, &on, &mut cache));
        assert!(!evaluate(&trackers, 2, &on, &mut cache));
        assert!(!evaluate(&trackers, 3, &on, &mut cache));

        let off = LogEvent::new(10, 2).with_value(Value::Int(1));
        let mut cache = vec![MatchingState::NotComputed; trackers.len()];
        assert!(evaluate(&trackers, 2, &off, &mut cache));
        assert!(evaluate(&trackers, 3, &off, &mut cache));
        assert_eq!(cache[1], MatchingState::Matched);

        let other_atom = LogEvent::new(11, 3);
        let mut cache = vec![MatchingState::NotComputed; trackers.len()];
        assert!(!evaluate(&trackers, 3, &other_atom, &mut cache));
    }

    /// Matcher `100 + i` always points at `100 + i - 1`, plus extra edges to lower indices
    fn chain(len: usize, extra: &[u16]) -> Vec<AtomMatcher> {
        let mut configs = vec![simple(100, 10)];
        for i in 1..len {
            let mut children = vec![100 + i as i64 - 1];
            for pick in extra {
                let child = 100 + (*pick as usize % i) as i64;
                if !children.contains(&child) {
                    children.push(child);
                }
            }
            configs.push(AtomMatcher::combination(
                100 + i as i64,
                LogicalOperation::Or,
                children,
            ));
        }
        configs
    }

    proptest! {
        #[test]
        fn prop_acyclic_combinations_initialize(
            len in 1usize..10,
            extra in prop::collection::vec(any::<u16>(), 0..6),
        ) {
            let trackers = build(&chain(len, &extra)).unwrap();
            for tracker in &trackers {
                prop_assert!(tracker.initialized);
                prop_assert_eq!(&tracker.atom_ids, &BTreeSet::from([10]));
            }
        }

        #[test]
        fn prop_back_edge_is_always_a_cycle(
            len in 2usize..10,
            extra in prop::collection::vec(any::<u16>(), 0..6),
            from in any::<u16>(),
            to in any::<u16>(),
        ) {
            let mut configs = chain(len, &extra);
            let k = 1 + from as usize % (len - 1);
            let j = k + to as usize % (len - k);
            if let Some(combination) = configs[k].combination.as_mut() {
                combination.matcher.push(100 + j as i64);
            }
            let err = build(&configs).unwrap_err();
            prop_assert_eq!(err.code, InvalidConfigReasonCode::MatcherCycle);
        }
    }
}
