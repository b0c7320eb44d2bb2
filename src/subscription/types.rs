use crate::config::SimpleAtomMatcher;
use crate::event::LogEvent;
use serde::{Deserialize, Serialize};

/// Shortest allowed interval between two pulls of the same atom
pub const MIN_PULL_INTERVAL_MILLIS: i64 = 1000;

/// Pulled atom requested by a shell client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulledAtomSubscription {
    pub matcher: SimpleAtomMatcher,
    #[serde(default = "default_freq_millis")]
    pub freq_millis: i64,
    #[serde(default)]
    pub packages: Vec<String>,
}

fn default_freq_millis() -> i64 {
    MIN_PULL_INTERVAL_MILLIS
}

/// What a shell client wants to receive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellSubscription {
    #[serde(default)]
    pub pushed: Vec<SimpleAtomMatcher>,
    #[serde(default)]
    pub pulled: Vec<PulledAtomSubscription>,
}

impl ShellSubscription {
    pub fn is_empty(&self) -> bool {
        self.pushed.is_empty() && self.pulled.is_empty()
    }

    /// Atom ids this subscription needs from the ingestion path
    pub fn atom_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.pushed
            .iter()
            .map(|m| m.atom_id)
            .chain(self.pulled.iter().map(|p| p.matcher.atom_id))
    }
}

/// Payload delivered to shell clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellData {
    pub atoms: Vec<LogEvent>,
    pub elapsed_timestamp_nanos: Vec<i64>,
}

impl ShellData {
    pub fn push(&mut self, event: LogEvent) {
        self.elapsed_timestamp_nanos.push(event.elapsed_timestamp_ns);
        self.atoms.push(event);
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }
}

/// Why a callback client is receiving data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackReason {
    /// Cache interval elapsed or the cache grew past its limit
    StatsdInitiated,
    FlushRequested,
    SubscriptionEnded,
}
