//! Periodic alarms independent of the event graph

use crate::config::{AlarmDef, SubscriptionDef};

#[derive(Debug, Clone)]
pub struct AlarmTracker {
    pub id: i64,
    offset_ns: i64,
    period_ns: i64,
    next_fire_ns: i64,
    pub subscriptions: Vec<SubscriptionDef>,
}

impl AlarmTracker {
    /// First firing is `offset` after `start_wall_ns`; `None` when the schedule does not fit
    /// in nanoseconds
    pub fn new(alarm: &AlarmDef, start_wall_ns: i64) -> Option<Self> {
        let offset_ns = alarm.offset_millis.checked_mul(1_000_000)?;
        let period_ns = alarm.period_millis.checked_mul(1_000_000)?;
        Some(Self {
            id: alarm.id,
            offset_ns,
            period_ns,
            next_fire_ns: start_wall_ns.checked_add(offset_ns)?,
            subscriptions: Vec::new(),
        })
    }

    pub fn next_fire_ns(&self) -> i64 {
        self.next_fire_ns
    }

    pub fn offset_ns(&self) -> i64 {
        self.offset_ns
    }

    /// Fires at most once per call and advances to the first slot after `now_wall_ns`
    pub fn fire_if_due(&mut self, now_wall_ns: i64) -> bool {
        if now_wall_ns < self.next_fire_ns {
            return false;
        }
        let missed = (now_wall_ns - self.next_fire_ns) / self.period_ns;
        self.next_fire_ns = self
            .next_fire_ns
            .saturating_add((missed + 1).saturating_mul(self.period_ns));
        true
    }
}
