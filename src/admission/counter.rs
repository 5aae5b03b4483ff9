//! Per-principal message counters and the metrics snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric key for messages received from a principal.
pub fn messages_received_key(principal: &str) -> String {
    format!("frameworks/{}/messages_received", principal)
}

/// Metric key for messages processed for a principal.
pub fn messages_processed_key(principal: &str) -> String {
    format!("frameworks/{}/messages_processed", principal)
}

/// Received and processed message counters for one principal group.
///
/// Both counters only ever increase; updates are lock-free.
#[derive(Debug, Default)]
pub struct MessageCounters {
    received: AtomicU64,
    processed: AtomicU64,
}

impl MessageCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a message on arrival, before any admission decision.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a message after it has been forwarded.
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Messages received so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    /// Messages processed so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Read both counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received(),
            processed: self.processed(),
        }
    }
}

/// Point-in-time values of one group's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub processed: u64,
}

/// Flat view of every live principal's counters, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsSnapshot {
    values: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the counters of one principal.
    pub fn insert(&mut self, principal: &str, counters: CounterSnapshot) {
        self.values
            .insert(messages_received_key(principal), counters.received);
        self.values
            .insert(messages_processed_key(principal), counters.processed);
    }

    /// Get a metric value by key.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.values.get(key).copied()
    }

    /// Received count for a principal, if its group is live.
    pub fn received(&self, principal: &str) -> Option<u64> {
        self.get(&messages_received_key(principal))
    }

    /// Processed count for a principal, if its group is live.
    pub fn processed(&self, principal: &str) -> Option<u64> {
        self.get(&messages_processed_key(principal))
    }

    /// Number of metric keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no principal is live.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over metric keys and values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Render the snapshot as a JSON object.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
