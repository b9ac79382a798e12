//! Operational counters.
//!
//! All counters are monotonically increasing (reset only on restart) and
//! incremented lock-free via `AtomicU64`.

use std::sync::atomic::AtomicU64;

/// Relay-wide metrics.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Events accepted (stored or dispatched).
    pub events_accepted: AtomicU64,
    /// Events rejected by validation.
    pub events_rejected: AtomicU64,
    /// Accepted events that were duplicates or conflict-rule losers.
    pub events_duplicate: AtomicU64,
    /// Accepted events that displaced a replaceable incumbent.
    pub events_replaced: AtomicU64,
    /// Connections accepted across all surfaces.
    pub connections_total: AtomicU64,
    /// Publishes rejected by the rate limiter.
    pub rate_limit_hits: AtomicU64,
}
