//! Lock-free metrics for the plan event bus.
//!
//! All counters use [`AtomicU64`] with [`Ordering::Relaxed`] — monotonic
//! counters carry no causal dependencies, so relaxed ordering avoids
//! needless fences on weak-memory architectures.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

const ORD: Ordering = Ordering::Relaxed;

/// Real-time, lock-free metrics for the [`PlanEventBus`](super::PlanEventBus).
///
/// Intended to be read without locking; for a serializable point-in-time
/// view call [`snapshot()`](Self::snapshot).
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Events accepted by `publish`.
    events_published: AtomicU64,
    /// Events handed to a subscriber buffer.
    events_delivered: AtomicU64,
    /// Events discarded because a subscriber buffer was full.
    events_dropped: AtomicU64,
    /// Subscribers disconnected as slow consumers.
    subscribers_dropped: AtomicU64,
    /// History entries evicted by the per-plan ring bound.
    history_evicted: AtomicU64,
}

impl BusMetrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_publish(&self) {
        self.events_published.fetch_add(1, ORD);
    }

    #[inline]
    pub(crate) fn record_delivery(&self) {
        self.events_delivered.fetch_add(1, ORD);
    }

    #[inline]
    pub(crate) fn record_drop(&self) {
        self.events_dropped.fetch_add(1, ORD);
    }

    #[inline]
    pub(crate) fn record_subscriber_drop(&self) {
        self.subscribers_dropped.fetch_add(1, ORD);
    }

    #[inline]
    pub(crate) fn record_history_eviction(&self) {
        self.history_evicted.fetch_add(1, ORD);
    }

    /// Events accepted by `publish`.
    pub fn events_published(&self) -> u64 {
        self.events_published.load(ORD)
    }

    /// Events handed to a subscriber buffer.
    pub fn events_delivered(&self) -> u64 {
        self.events_delivered.load(ORD)
    }

    /// Events discarded because a subscriber buffer was full.
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(ORD)
    }

    /// Subscribers disconnected as slow consumers.
    pub fn subscribers_dropped(&self) -> u64 {
        self.subscribers_dropped.load(ORD)
    }

    /// History entries evicted by the ring bound.
    pub fn history_evicted(&self) -> u64 {
        self.history_evicted.load(ORD)
    }

    /// Serializable point-in-time view.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published(),
            events_delivered: self.events_delivered(),
            events_dropped: self.events_dropped(),
            subscribers_dropped: self.subscribers_dropped(),
            history_evicted: self.history_evicted(),
        }
    }
}

/// Serializable snapshot of [`BusMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub subscribers_dropped: u64,
    pub history_evicted: u64,
}
