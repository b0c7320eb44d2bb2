//! Restricted event metrics buffer rows for the restricted store

use crate::event::LogEvent;
use crate::storage::TableReset;

/// Rows handed to the storage flush
#[derive(Debug, Clone, PartialEq)]
pub struct RestrictedBatch {
    pub metric_id: i64,
    pub reset: TableReset,
    pub rows: Vec<LogEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct RestrictedState {
    category: Option<i32>,
    reset_pending: bool,
    /// Set once this producer has written its table successfully
    table_created: bool,
    rows: Vec<LogEvent>,
}

impl RestrictedState {
    pub fn on_event(&mut self, event: &LogEvent) {
        if let Some(category) = self.category {
            if event.restriction_category != Some(category) {
                tracing::debug!(
                    "Restriction category changed from {} to {:?}, dropping {} buffered rows",
                    category,
                    event.restriction_category,
                    self.rows.len()
                );
                self.rows.clear();
                self.reset_pending = true;
            }
        }
        self.category = event.restriction_category;
        self.rows.push(event.clone());
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn category(&self) -> Option<i32> {
        self.category
    }

    /// Restores the category persisted before a restart
    pub fn restore_category(&mut self, category: i32) {
        if self.category.is_none() {
            self.category = Some(category);
        }
    }

    pub fn mark_table_created(&mut self) {
        self.table_created = true;
    }

    pub fn take_batch(&mut self, metric_id: i64) -> Option<RestrictedBatch> {
        if self.rows.is_empty() && !self.reset_pending {
            return None;
        }
        let reset = if self.reset_pending {
            TableReset::Always
        } else if self.table_created {
            TableReset::Never
        } else {
            // The table may predate this process and have an older layout
            TableReset::IfIncompatible
        };
        let batch = RestrictedBatch {
            metric_id,
            reset,
            rows: std::mem::take(&mut self.rows),
        };
        self.reset_pending = false;
        Some(batch)
    }

    /// Restores a batch that could not be written, ahead of newer rows
    pub fn requeue(&mut self, mut batch: RestrictedBatch) {
        if self.reset_pending {
            // A newer category change already invalidated these rows
            return;
        }
        self.reset_pending = batch.reset == TableReset::Always;
        batch.rows.append(&mut self.rows);
        self.rows = batch.rows;
    }

    pub fn carry_data_from(&mut self, old: &RestrictedState) {
        self.category = old.category;
        self.reset_pending = old.reset_pending;
        self.table_created = old.table_created;
        self.rows = old.rows.clone();
    }

    /// Keeps the table bookkeeping of a replaced producer but none of its rows
    pub fn carry_table_state_from(&mut self, old: &RestrictedState) {
        self.category = old.category;
        self.reset_pending = old.reset_pending;
        self.table_created = old.table_created;
    }
}
