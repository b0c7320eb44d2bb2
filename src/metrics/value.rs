//! Value metrics aggregate numeric fields of pushed atoms

use super::bucket::{bucket_values, Buckets, Slot};
use super::report::DimensionData;
use crate::config::ValueAggregation;
use crate::event::{FieldRef, LogEvent, MetricDimensionKey};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FieldAggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl FieldAggregate {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    fn result(&self, aggregation: ValueAggregation) -> f64 {
        match aggregation {
            ValueAggregation::Sum => self.sum,
            ValueAggregation::Min => self.min,
            ValueAggregation::Max => self.max,
            ValueAggregation::Avg if self.count > 0 => self.sum / self.count as f64,
            ValueAggregation::Avg => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueAggregate {
    fields: Vec<FieldAggregate>,
}

impl ValueAggregate {
    fn has_data(&self) -> bool {
        self.fields.iter().any(|f| f.count > 0)
    }
}

#[derive(Debug, Clone)]
pub struct ValueState {
    value_fields: Vec<FieldRef>,
    aggregation: ValueAggregation,
    buckets: Buckets<ValueAggregate>,
}

impl ValueState {
    pub fn new(value_fields: Vec<FieldRef>, aggregation: ValueAggregation) -> Self {
        Self {
            value_fields,
            aggregation,
            buckets: Buckets::default(),
        }
    }

    /// Folds the event's value fields into `key`; returns the first field's aggregate
    pub fn on_event(
        &mut self,
        key: &MetricDimensionKey,
        event: &LogEvent,
        hard_limit: usize,
    ) -> Option<i64> {
        let aggregation = self.aggregation;
        let slot = match self.buckets.slot(key, hard_limit) {
            Slot::Ready(slot) => slot,
            Slot::OverLimit => return None,
        };
        if slot.fields.len() < self.value_fields.len() {
            slot.fields
                .resize(self.value_fields.len(), FieldAggregate::default());
        }
        for (field_ref, aggregate) in self.value_fields.iter().zip(slot.fields.iter_mut()) {
            if let Some(value) = event
                .resolve(field_ref)
                .into_iter()
                .find_map(|v| v.as_f64())
            {
                aggregate.add(value);
            }
        }
        Some(
            slot.fields
                .first()
                .map_or(0, |f| f.result(aggregation) as i64),
        )
    }

    pub fn close(&mut self, start_ns: i64, end_ns: i64) -> HashMap<MetricDimensionKey, i64> {
        let aggregation = self.aggregation;
        let closed = self
            .buckets
            .close(start_ns, end_ns, ValueAggregate::has_data);
        bucket_values(&closed, |a| {
            a.fields.first().map_or(0, |f| f.result(aggregation) as i64)
        })
    }

    pub fn report(&self, current_start_ns: i64, now_ns: i64) -> Vec<DimensionData<Vec<f64>>> {
        let aggregation = self.aggregation;
        self.buckets.report(
            current_start_ns,
            now_ns,
            ValueAggregate::has_data,
            |a| a.fields.iter().map(|f| f.result(aggregation)).collect(),
        )
    }

    pub fn erase(&mut self) {
        self.buckets.erase();
    }

    pub fn carry_data_from(&mut self, old: &ValueState) {
        self.buckets = old.buckets.clone();
    }
}
