//! Live shell subscriptions
//!
//! Shell clients subscribe to pushed atoms (matched on the ingestion path) and pulled atoms
//! (fetched periodically from a [`PullSource`]). Matching events are cached per client and
//! delivered by the background worker, either as length-prefixed frames on a pipe or through
//! a callback.

pub mod error;
pub mod transport;
pub mod types;

pub use error::{SubscriptionError, SubscriptionResult};
pub use transport::{read_frame, write_frame, PullSource, ShellTransport, SubscriptionCallback};
pub use types::{
    CallbackReason, PulledAtomSubscription, ShellData, ShellSubscription,
    MIN_PULL_INTERVAL_MILLIS,
};

use crate::config::{DaemonSettings, SimpleAtomMatcher};
use crate::event::LogEvent;
use crate::filter::{ConsumerId, LogEventFilter};
use crate::matcher::matches_simple;
use crate::stats::DaemonStats;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cached bytes above which a callback client is served before its interval elapses
pub const MAX_CACHE_BYTES: usize = 2 * 1024;

struct ClientState {
    subscription: ShellSubscription,
    is_callback: bool,
    pending: ShellData,
    pending_bytes: usize,
    last_delivery_ms: i64,
    next_pull_ms: Vec<i64>,
    transport: Arc<tokio::sync::Mutex<ShellTransport>>,
}

impl ClientState {
    fn append(&mut self, event: LogEvent) {
        self.pending_bytes += serde_json::to_vec(&event).map(|b| b.len()).unwrap_or(0);
        self.pending.push(event);
    }

    fn take_pending(&mut self) -> ShellData {
        self.pending_bytes = 0;
        std::mem::take(&mut self.pending)
    }
}

enum Delivery {
    Data(ShellData, CallbackReason),
    Heartbeat,
}

/// Registry of shell clients
pub struct ShellSubscriber {
    clients: parking_lot::Mutex<HashMap<String, ClientState>>,
    filter: Arc<LogEventFilter>,
    stats: Arc<DaemonStats>,
    pull_source: Option<Arc<dyn PullSource>>,
    max_subscriptions: usize,
    heartbeat_interval_ms: i64,
    min_callback_interval_ms: i64,
    started: Instant,
}

impl ShellSubscriber {
    pub fn new(
        settings: &DaemonSettings,
        filter: Arc<LogEventFilter>,
        stats: Arc<DaemonStats>,
    ) -> Self {
        Self {
            clients: parking_lot::Mutex::new(HashMap::new()),
            filter,
            stats,
            pull_source: None,
            max_subscriptions: settings.max_subscriptions,
            heartbeat_interval_ms: settings.heartbeat_interval_millis as i64,
            min_callback_interval_ms: settings.min_callback_interval_millis as i64,
            started: Instant::now(),
        }
    }

    pub fn with_pull_source(mut self, source: Arc<dyn PullSource>) -> Self {
        self.pull_source = Some(source);
        self
    }

    /// Milliseconds since this subscriber was created
    pub fn now_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Registers a client and returns its subscription id
    pub fn subscribe(
        &self,
        mut subscription: ShellSubscription,
        transport: ShellTransport,
        now_ms: i64,
    ) -> SubscriptionResult<String> {
        if subscription.is_empty() {
            return Err(SubscriptionError::invalid("no pushed or pulled atoms"));
        }
        for pulled in &mut subscription.pulled {
            pulled.freq_millis = pulled.freq_millis.max(MIN_PULL_INTERVAL_MILLIS);
        }

        let mut clients = self.clients.lock();
        if clients.len() >= self.max_subscriptions {
            warn!(
                "Rejecting shell subscription, {} already active",
                clients.len()
            );
            return Err(SubscriptionError::TooManySubscriptions(
                self.max_subscriptions,
            ));
        }

        let id = Uuid::new_v4().to_string();
        let state = ClientState {
            next_pull_ms: vec![now_ms; subscription.pulled.len()],
            is_callback: transport.is_callback(),
            subscription,
            pending: ShellData::default(),
            pending_bytes: 0,
            last_delivery_ms: now_ms,
            transport: Arc::new(tokio::sync::Mutex::new(transport)),
        };
        clients.insert(id.clone(), state);
        self.refresh_filter(&clients);
        drop(clients);

        self.stats.note_subscription_started();
        info!("Started shell subscription {}", id);
        Ok(id)
    }

    /// Ends a subscription, delivering whatever is still cached
    pub async fn unsubscribe(&self, id: &str) -> SubscriptionResult<()> {
        let mut state = self
            .remove_client(id)
            .ok_or_else(|| SubscriptionError::UnknownSubscription(id.to_string()))?;
        let data = state.take_pending();
        let mut transport = state.transport.lock().await;
        if state.is_callback || !data.is_empty() {
            if let Err(e) = transport
                .send(id, data, CallbackReason::SubscriptionEnded)
                .await
            {
                debug!("Final delivery to {} failed: {}", id, e);
            }
        }
        Ok(())
    }

    /// Delivers the cache of a client right away
    pub async fn flush_subscription(&self, id: &str) -> SubscriptionResult<()> {
        let (data, transport) = {
            let mut clients = self.clients.lock();
            let state = clients
                .get_mut(id)
                .ok_or_else(|| SubscriptionError::UnknownSubscription(id.to_string()))?;
            state.last_delivery_ms = self.now_ms();
            (state.take_pending(), state.transport.clone())
        };
        let result = transport
            .lock()
            .await
            .send(id, data, CallbackReason::FlushRequested)
            .await;
        if let Err(e) = result {
            debug!("Pruning shell subscription {}: {}", id, e);
            self.remove_client(id);
        }
        Ok(())
    }

    /// Caches the event for every client with a matching pushed matcher
    pub fn on_log_event(&self, event: &LogEvent) {
        let mut clients = self.clients.lock();
        for state in clients.values_mut() {
            let wanted = state
                .subscription
                .pushed
                .iter()
                .any(|matcher| matches_simple(matcher, event));
            if wanted {
                state.append(event.clone());
            }
        }
    }

    /// Pulls due atoms, then delivers caches and heartbeats. Returns the number of deliveries.
    pub async fn run_once(&self, now_ms: i64) -> usize {
        self.pull_due(now_ms).await;

        let work: Vec<(String, Arc<tokio::sync::Mutex<ShellTransport>>, Delivery)> = {
            let mut clients = self.clients.lock();
            clients
                .iter_mut()
                .filter_map(|(id, state)| {
                    let since = now_ms - state.last_delivery_ms;
                    let due = if state.is_callback {
                        !state.pending.is_empty()
                            && (since >= self.min_callback_interval_ms
                                || state.pending_bytes > MAX_CACHE_BYTES)
                    } else {
                        !state.pending.is_empty()
                    };
                    let delivery = if due {
                        Delivery::Data(state.take_pending(), CallbackReason::StatsdInitiated)
                    } else if !state.is_callback && since >= self.heartbeat_interval_ms {
                        Delivery::Heartbeat
                    } else {
                        return None;
                    };
                    state.last_delivery_ms = now_ms;
                    Some((id.clone(), state.transport.clone(), delivery))
                })
                .collect()
        };

        let mut delivered = 0;
        for (id, transport, delivery) in work {
            let mut transport = transport.lock().await;
            let result = match delivery {
                Delivery::Data(data, reason) => transport.send(&id, data, reason).await,
                Delivery::Heartbeat => transport.heartbeat().await,
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("Pruning shell subscription {}: {}", id, e);
                    self.remove_client(&id);
                }
            }
        }
        delivered
    }

    /// Runs [`Self::run_once`] on every tick until the task is aborted
    pub fn spawn(self: Arc<Self>, tick: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                self.run_once(self.now_ms()).await;
            }
        })
    }

    async fn pull_due(&self, now_ms: i64) {
        let Some(source) = &self.pull_source else {
            return;
        };
        let due: Vec<(String, SimpleAtomMatcher, Vec<String>)> = {
            let mut clients = self.clients.lock();
            let mut due = Vec::new();
            for (id, state) in clients.iter_mut() {
                for (idx, pulled) in state.subscription.pulled.iter().enumerate() {
                    if now_ms >= state.next_pull_ms[idx] {
                        state.next_pull_ms[idx] = now_ms + pulled.freq_millis;
                        due.push((id.clone(), pulled.matcher.clone(), pulled.packages.clone()));
                    }
                }
            }
            due
        };

        for (id, matcher, packages) in due {
            match source.pull(matcher.atom_id, &packages).await {
                Ok(events) => {
                    let mut clients = self.clients.lock();
                    if let Some(state) = clients.get_mut(&id) {
                        for event in events {
                            if matches_simple(&matcher, &event) {
                                state.append(event);
                            }
                        }
                    }
                }
                Err(e) => warn!("Pull of atom {} failed: {}", matcher.atom_id, e),
            }
        }
    }

    fn remove_client(&self, id: &str) -> Option<ClientState> {
        let mut clients = self.clients.lock();
        let state = clients.remove(id)?;
        self.refresh_filter(&clients);
        drop(clients);
        self.stats.note_subscription_ended();
        info!("Ended shell subscription {}", id);
        Some(state)
    }

    fn refresh_filter(&self, clients: &HashMap<String, ClientState>) {
        let atoms: BTreeSet<i32> = clients
            .values()
            .flat_map(|state| state.subscription.atom_ids())
            .collect();
        self.filter.set_atom_ids(ConsumerId::Shell, atoms);
    }
}
