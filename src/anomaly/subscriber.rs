//! Delivery of alert and alarm notifications to subscribers

use crate::config::{ConfigKey, RuleType, SubscriptionDef};
use crate::event::MetricDimensionKey;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub config_key: ConfigKey,
    pub rule_type: RuleType,
    pub rule_id: i64,
    pub subscription_id: i64,
    pub subscriber: String,
    pub metric_id: Option<i64>,
    pub dimension: Option<MetricDimensionKey>,
    pub timestamp_ns: i64,
}

/// Receives notifications on the ingestion path; implementations must not block
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Logs notifications
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notification: Notification) {
        tracing::info!(
            "Informing subscriber {} of {:?} {} (config {})",
            notification.subscriber,
            notification.rule_type,
            notification.rule_id,
            notification.config_key
        );
    }
}

/// Forwards notifications to an async consumer
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("Notification receiver dropped");
        }
    }
}

/// Applies `probability_of_informing` and builds one notification per selected subscription
pub(crate) fn select_subscriptions<'a>(
    subscriptions: &'a [SubscriptionDef],
) -> impl Iterator<Item = &'a SubscriptionDef> + 'a {
    subscriptions.iter().filter(|sub| {
        sub.probability_of_informing >= 1.0 || rand::random::<f32>() < sub.probability_of_informing
    })
}
