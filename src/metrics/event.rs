//! Event metrics keep every matched atom

use super::report::EventRecord;
use crate::event::LogEvent;

#[derive(Debug, Clone, Default)]
pub struct EventState {
    records: Vec<EventRecord>,
}

impl EventState {
    pub fn on_event(&mut self, event: &LogEvent) {
        self.records.push(EventRecord {
            elapsed_timestamp_ns: event.elapsed_timestamp_ns,
            atom: event.clone(),
        });
    }

    pub fn report(&self) -> Vec<EventRecord> {
        self.records.clone()
    }

    pub fn erase(&mut self) {
        self.records.clear();
    }

    pub fn carry_data_from(&mut self, old: &EventState) {
        self.records = old.records.clone();
    }
}
