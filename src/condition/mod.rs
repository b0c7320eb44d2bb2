//! Condition trackers
//!
//! Simple conditions flip on start/stop/stop-all matchers and may be sliced by their own
//! dimensions. Combination conditions fold children with tri-state logic.

use crate::compiler::reason::{CompileResult, InvalidConfigReason, InvalidConfigReasonCode};
use crate::config::{InitialValue, LogicalOperation, Predicate};
use crate::event::{DimensionKey, FieldRef, LogEvent};
use crate::hash::content_hash;
use crate::matcher::MatchingState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionState {
    NotEvaluated,
    Unknown,
    False,
    True,
}

impl ConditionState {
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }

    pub fn negate(self) -> Self {
        match self {
            Self::True => Self::False,
            Self::False => Self::True,
            other => other,
        }
    }

    pub fn is_true(self) -> bool {
        self == Self::True
    }
}

pub fn combine_states(operation: LogicalOperation, states: &[ConditionState]) -> ConditionState {
    let unknown = |s: &ConditionState| {
        matches!(s, ConditionState::Unknown | ConditionState::NotEvaluated)
    };
    let and = || {
        if states.iter().any(|s| *s == ConditionState::False) {
            ConditionState::False
        } else if states.iter().any(unknown) {
            ConditionState::Unknown
        } else {
            ConditionState::True
        }
    };
    let or = || {
        if states.iter().any(|s| *s == ConditionState::True) {
            ConditionState::True
        } else if states.iter().any(unknown) {
            ConditionState::Unknown
        } else {
            ConditionState::False
        }
    };
    match operation {
        LogicalOperation::And => and(),
        LogicalOperation::Or => or(),
        LogicalOperation::Not => states
            .first()
            .copied()
            .unwrap_or(ConditionState::Unknown)
            .negate(),
        LogicalOperation::Nand => and().negate(),
        LogicalOperation::Nor => or().negate(),
    }
}

#[derive(Debug, Clone)]
pub struct SimpleCondition {
    pub start_id: Option<i64>,
    pub stop_id: Option<i64>,
    pub stop_all_id: Option<i64>,
    pub start: Option<usize>,
    pub stop: Option<usize>,
    pub stop_all: Option<usize>,
    pub count_nesting: bool,
    pub dimensions: Vec<FieldRef>,
    /// Nesting count per started slice
    slices: HashMap<DimensionKey, i32>,
}

impl SimpleCondition {
    pub fn started_slices(&self) -> impl Iterator<Item = &DimensionKey> {
        self.slices.keys()
    }
}

#[derive(Debug, Clone)]
pub enum ConditionKind {
    Simple(SimpleCondition),
    Combination {
        operation: LogicalOperation,
        child_ids: Vec<i64>,
        children: Vec<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct ConditionTracker {
    pub id: i64,
    pub index: usize,
    pub hash: u64,
    pub kind: ConditionKind,
    /// Matcher indices whose events can change this condition
    pub matcher_indices: BTreeSet<usize>,
    pub sliced: bool,
    pub initial_state: ConditionState,
    state: ConditionState,
    initialized: bool,
}

impl ConditionTracker {
    pub fn create(config: &Predicate, index: usize) -> CompileResult<Self> {
        let (kind, initial_state, sliced) = match (&config.simple_predicate, &config.combination)
        {
            (Some(simple), None) => {
                let initial = match simple.initial_value {
                    InitialValue::Unknown => ConditionState::Unknown,
                    InitialValue::False => ConditionState::False,
                };
                (
                    ConditionKind::Simple(SimpleCondition {
                        start_id: simple.start,
                        stop_id: simple.stop,
                        stop_all_id: simple.stop_all,
                        start: None,
                        stop: None,
                        stop_all: None,
                        count_nesting: simple.count_nesting,
                        dimensions: simple.dimensions.clone(),
                        slices: HashMap::new(),
                    }),
                    initial,
                    !simple.dimensions.is_empty(),
                )
            }
            (None, Some(combination)) => {
                if combination.predicate.is_empty() {
                    return Err(InvalidConfigReason::condition(
                        InvalidConfigReasonCode::ConditionNoChildren,
                        config.id,
                    ));
                }
                if combination.operation == LogicalOperation::Not
                    && combination.predicate.len() != 1
                {
                    return Err(InvalidConfigReason::condition(
                        InvalidConfigReasonCode::ConditionNotOperationIsNotUnary,
                        config.id,
                    ));
                }
                (
                    ConditionKind::Combination {
                        operation: combination.operation,
                        child_ids: combination.predicate.clone(),
                        children: Vec::new(),
                    },
                    ConditionState::NotEvaluated,
                    false,
                )
            }
            _ => {
                return Err(InvalidConfigReason::condition(
                    InvalidConfigReasonCode::ConditionMalformedContentsCase,
                    config.id,
                ))
            }
        };

        Ok(Self {
            id: config.id,
            index,
            hash: content_hash(config),
            kind,
            matcher_indices: BTreeSet::new(),
            sliced,
            initial_state,
            state: initial_state,
            initialized: false,
        })
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.kind, ConditionKind::Simple(_))
    }

    pub fn children(&self) -> &[usize] {
        match &self.kind {
            ConditionKind::Simple(_) => &[],
            ConditionKind::Combination { children, .. } => children,
        }
    }

    pub fn as_simple(&self) -> Option<&SimpleCondition> {
        match &self.kind {
            ConditionKind::Simple(simple) => Some(simple),
            ConditionKind::Combination { .. } => None,
        }
    }

    /// Current unsliced truth value
    pub fn state(&self) -> ConditionState {
        self.state
    }

    /// Takes over the runtime truth state of a preserved tracker
    pub fn carry_state_from(&mut self, old: &ConditionTracker) {
        self.state = old.state;
        if let (ConditionKind::Simple(new), ConditionKind::Simple(prev)) =
            (&mut self.kind, &old.kind)
        {
            new.slices = prev.slices.clone();
        }
    }
}

/// Resolves matcher and child references and computes initial truth values
pub fn init_conditions(
    trackers: &mut [ConditionTracker],
    condition_ids: &HashMap<i64, usize>,
    matcher_ids: &HashMap<i64, usize>,
) -> CompileResult<()> {
    let mut on_stack = vec![false; trackers.len()];
    for index in 0..trackers.len() {
        init_one(trackers, condition_ids, matcher_ids, index, &mut on_stack)
            .map_err(|e| e.reverse_ids())?;
    }
    Ok(())
}

fn resolve_matcher(
    matcher_ids: &HashMap<i64, usize>,
    id: Option<i64>,
    code: InvalidConfigReasonCode,
    condition_id: i64,
) -> CompileResult<Option<usize>> {
    match id {
        None => Ok(None),
        Some(id) => matcher_ids.get(&id).copied().map(Some).ok_or_else(|| {
            InvalidConfigReason::condition(code, condition_id).with_matcher(id)
        }),
    }
}

fn init_one(
    trackers: &mut [ConditionTracker],
    condition_ids: &HashMap<i64, usize>,
    matcher_ids: &HashMap<i64, usize>,
    index: usize,
    on_stack: &mut [bool],
) -> CompileResult<()> {
    if trackers[index].initialized {
        return Ok(());
    }
    let id = trackers[index].id;

    let child_ids = match &mut trackers[index].kind {
        ConditionKind::Simple(simple) => {
            simple.start = resolve_matcher(
                matcher_ids,
                simple.start_id,
                InvalidConfigReasonCode::ConditionStartMatcherNotFound,
                id,
            )?;
            simple.stop = resolve_matcher(
                matcher_ids,
                simple.stop_id,
                InvalidConfigReasonCode::ConditionStopMatcherNotFound,
                id,
            )?;
            simple.stop_all = resolve_matcher(
                matcher_ids,
                simple.stop_all_id,
                InvalidConfigReasonCode::ConditionStopAllMatcherNotFound,
                id,
            )?;
            let indices: BTreeSet<usize> = [simple.start, simple.stop, simple.stop_all]
                .into_iter()
                .flatten()
                .collect();
            trackers[index].matcher_indices = indices;
            trackers[index].initialized = true;
            return Ok(());
        }
        ConditionKind::Combination { child_ids, .. } => child_ids.clone(),
    };

    on_stack[index] = true;
    let mut children = Vec::with_capacity(child_ids.len());
    let mut matcher_indices = BTreeSet::new();
    let mut child_states = Vec::with_capacity(child_ids.len());
    let mut sliced = false;
    for child_id in child_ids {
        let Some(&child) = condition_ids.get(&child_id) else {
            return Err(InvalidConfigReason::condition(
                InvalidConfigReasonCode::ConditionChildNotFound,
                child_id,
            )
            .with_condition(id));
        };
        if on_stack[child] {
            return Err(InvalidConfigReason::condition(
                InvalidConfigReasonCode::ConditionCycle,
                child_id,
            )
            .with_condition(id));
        }
        if let Err(reason) = init_one(trackers, condition_ids, matcher_ids, child, on_stack) {
            return Err(reason.with_condition(id));
        }
        matcher_indices.extend(trackers[child].matcher_indices.iter().copied());
        child_states.push(trackers[child].initial_state);
        sliced |= trackers[child].sliced;
        children.push(child);
    }
    on_stack[index] = false;

    let tracker = &mut trackers[index];
    if let ConditionKind::Combination {
        operation,
        children: resolved,
        ..
    } = &mut tracker.kind
    {
        tracker.initial_state = combine_states(*operation, &child_states);
        *resolved = children;
    }
    tracker.state = tracker.initial_state;
    tracker.matcher_indices = matcher_indices;
    tracker.sliced = sliced;
    tracker.initialized = true;
    Ok(())
}

/// Updates condition `index` for `event`. Returns true if its value (or any slice) changed.
pub fn evaluate(
    trackers: &mut [ConditionTracker],
    index: usize,
    event: &LogEvent,
    matcher_cache: &[MatchingState],
    cache: &mut [ConditionState],
    changed: &mut [bool],
) -> ConditionState {
    if cache[index] != ConditionState::NotEvaluated {
        return cache[index];
    }

    let children: Vec<usize> = trackers[index].children().to_vec();
    if !children.is_empty() {
        let mut states = Vec::with_capacity(children.len());
        let mut any_child_changed = false;
        for &child in &children {
            states.push(evaluate(trackers, child, event, matcher_cache, cache, changed));
            any_child_changed |= changed[child];
        }
        let tracker = &mut trackers[index];
        let ConditionKind::Combination { operation, .. } = &tracker.kind else {
            return tracker.state;
        };
        let new_state = combine_states(*operation, &states);
        changed[index] = new_state != tracker.state || (tracker.sliced && any_child_changed);
        tracker.state = new_state;
        cache[index] = new_state;
        return new_state;
    }

    let tracker = &mut trackers[index];
    let prior = tracker.state;
    let ConditionKind::Simple(simple) = &mut tracker.kind else {
        return prior;
    };
    let matched = |idx: Option<usize>| {
        idx.is_some_and(|i| matcher_cache[i] == MatchingState::Matched)
    };

    let mut slice_changed = false;
    if matched(simple.stop_all) {
        slice_changed = !simple.slices.is_empty();
        simple.slices.clear();
        tracker.state = ConditionState::False;
    } else if matched(simple.start) {
        let key = DimensionKey::extract(event, &simple.dimensions);
        let count = simple.slices.entry(key).or_insert(0);
        slice_changed = *count == 0;
        *count = if simple.count_nesting { *count + 1 } else { 1 };
        tracker.state = ConditionState::True;
    } else if matched(simple.stop) {
        let key = DimensionKey::extract(event, &simple.dimensions);
        if let Some(count) = simple.slices.get_mut(&key) {
            *count = if simple.count_nesting { *count - 1 } else { 0 };
            if *count <= 0 {
                simple.slices.remove(&key);
                slice_changed = true;
            }
        }
        tracker.state = ConditionState::from_bool(!simple.slices.is_empty());
    }

    changed[index] = tracker.state != prior || (tracker.sliced && slice_changed);
    cache[index] = tracker.state;
    tracker.state
}

/// Truth value of condition `index`, using the linked key supplied for each sliced condition
pub fn query(
    trackers: &[ConditionTracker],
    index: usize,
    keys: &HashMap<usize, DimensionKey>,
) -> ConditionState {
    let tracker = &trackers[index];
    match &tracker.kind {
        ConditionKind::Simple(simple) => match keys.get(&index) {
            Some(key) if tracker.sliced => {
                if simple.slices.keys().any(|slice| slice.contains(key)) {
                    ConditionState::True
                } else if tracker.state == ConditionState::Unknown {
                    ConditionState::Unknown
                } else {
                    ConditionState::False
                }
            }
            _ => tracker.state,
        },
        ConditionKind::Combination {
            operation,
            children,
            ..
        } => {
            let states: Vec<ConditionState> = children
                .iter()
                .map(|&child| query(trackers, child, keys))
                .collect();
            combine_states(*operation, &states)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimplePredicate;
    use crate::event::Value;

    fn simple(id: i64, start: i64, stop: i64, dims: Vec<FieldRef>) -> Predicate {
        Predicate::simple(
            id,
            SimplePredicate {
                start: Some(start),
                stop: Some(stop),
                dimensions: dims,
                ..SimplePredicate::default()
            },
        )
    }

    fn build(configs: &[Predicate]) -> CompileResult<Vec<ConditionTracker>> {
        let matcher_ids: HashMap<i64, usize> = (1..=6).map(|id| (id, id as usize - 1)).collect();
        let mut trackers = Vec::new();
        let mut ids = HashMap::new();
        for (index, config) in configs.iter().enumerate() {
            trackers.push(ConditionTracker::create(config, index)?);
            ids.insert(config.id, index);
        }
        init_conditions(&mut trackers, &ids, &matcher_ids)?;
        Ok(trackers)
    }

    fn matched(indices: &[usize]) -> Vec<MatchingState> {
        let mut cache = vec![MatchingState::NotMatched; 6];
        for &i in indices {
            cache[i] = MatchingState::Matched;
        }
        cache
    }

    fn run(
        trackers: &mut [ConditionTracker],
        event: &LogEvent,
        matcher_cache: &[MatchingState],
    ) -> Vec<bool> {
        let mut cache = vec![ConditionState::NotEvaluated; trackers.len()];
        let mut changed = vec![false; trackers.len()];
        for index in 0..trackers.len() {
            evaluate(trackers, index, event, matcher_cache, &mut cache, &mut changed);
        }
        changed
    }

    #[test]
    fn test_tri_state_logic() {
        use ConditionState::*;
        assert_eq!(combine_states(LogicalOperation::And, &[True, Unknown]), Unknown);
        assert_eq!(combine_states(LogicalOperation::And, &[False, Unknown]), False);
        assert_eq!(combine_states(LogicalOperation::Or, &[True, Unknown]), True);
        assert_eq!(combine_states(LogicalOperation::Or, &[False, Unknown]), Unknown);
        assert_eq!(combine_states(LogicalOperation::Not, &[Unknown]), Unknown);
        assert_eq!(combine_states(LogicalOperation::Nor, &[False, False]), True);
        assert_eq!(combine_states(LogicalOperation::Nand, &[True, True]), False);
    }

    #[test]
    fn test_initial_values_propagate() {
        let mut off = simple(10, 1, 2, vec![]);
        if let Some(p) = off.simple_predicate.as_mut() {
            p.initial_value = InitialValue::False;
        }
        let trackers = build(&[
            off,
            simple(11, 3, 4, vec![]),
            Predicate::combination(12, LogicalOperation::Not, vec![10]),
            Predicate::combination(13, LogicalOperation::And, vec![10, 11]),
        ])
        .unwrap();
        assert_eq!(trackers[0].initial_state, ConditionState::False);
        assert_eq!(trackers[1].initial_state, ConditionState::Unknown);
        assert_eq!(trackers[2].initial_state, ConditionState::True);
        assert_eq!(trackers[3].initial_state, ConditionState::False);
        assert_eq!(trackers[3].matcher_indices, BTreeSet::from([0, 1, 2, 3]));
    }

    #[test]
    fn test_cycle_detection() {
        let err = build(&[
            Predicate::combination(10, LogicalOperation::Or, vec![11]),
            Predicate::combination(11, LogicalOperation::Or, vec![10]),
        ])
        .unwrap_err();
        assert_eq!(err.code, InvalidConfigReasonCode::ConditionCycle);
        assert_eq!(err.condition_ids, vec![10, 11, 10]);
    }

    #[test]
    fn test_missing_start_matcher() {
        let err = build(&[simple(10, 42, 2, vec![])]).unwrap_err();
        assert_eq!(err.code, InvalidConfigReasonCode::ConditionStartMatcherNotFound);
        assert_eq!(err.matcher_ids, vec![42]);
    }

    #[test]
    fn test_nesting_counts() {
        let mut trackers = build(&[simple(10, 1, 2, vec![])]).unwrap();
        let event = LogEvent::new(1, 1);

        let changed = run(&mut trackers, &event, &matched(&[0]));
        assert!(changed[0]);
        run(&mut trackers, &event, &matched(&[0]));
        let changed = run(&mut trackers, &event, &matched(&[1]));
        assert!(!changed[0]);
        assert_eq!(trackers[0].state(), ConditionState::True);
        let changed = run(&mut trackers, &event, &matched(&[1]));
        assert!(changed[0]);
        assert_eq!(trackers[0].state(), ConditionState::False);
    }

    #[test]
    fn test_sliced_query_with_partial_key() {
        let mut trackers = build(&[
            Predicate::simple(
                10,
                SimplePredicate {
                    start: Some(1),
                    stop: Some(2),
                    stop_all: Some(3),
                    dimensions: vec![FieldRef::new(1)],
                    ..SimplePredicate::default()
                },
            ),
            Predicate::combination(11, LogicalOperation::Not, vec![10]),
        ])
        .unwrap();
        let uid_7 = LogEvent::new(1, 1).with_value(Value::Int(7));
        run(&mut trackers, &uid_7, &matched(&[0]));

        let key_7 = DimensionKey::extract(&uid_7, &[FieldRef::new(1)]);
        let uid_8 = LogEvent::new(1, 1).with_value(Value::Int(8));
        let key_8 = DimensionKey::extract(&uid_8, &[FieldRef::new(1)]);
        let linked = |key: &DimensionKey| HashMap::from([(0usize, key.clone())]);
        assert_eq!(query(&trackers, 0, &linked(&key_7)), ConditionState::True);
        assert_eq!(query(&trackers, 0, &linked(&key_8)), ConditionState::False);
        assert_eq!(query(&trackers, 1, &linked(&key_8)), ConditionState::True);
        assert_eq!(query(&trackers, 0, &HashMap::new()), ConditionState::True);

        let changed = run(&mut trackers, &uid_8, &matched(&[2]));
        assert!(changed[0]);
        assert_eq!(query(&trackers, 0, &linked(&key_7)), ConditionState::False);
    }
}
