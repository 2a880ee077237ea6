//! Delivery counters and the status snapshot exposed to health reporters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::ConnectionState;

/// Counters for one process's bus activity.
#[derive(Debug, Default)]
pub struct BusStats {
    /// Messages confirmed by the broker (live and replayed).
    pub published: AtomicU64,
    /// Messages placed in the replay buffer.
    pub buffered: AtomicU64,
    /// Messages dropped: buffer full or unserializable.
    pub dropped: AtomicU64,
    /// Buffered messages successfully replayed.
    pub flushed: AtomicU64,
    /// Deliveries handed to a handler.
    pub delivered: AtomicU64,
    /// Deliveries whose handler failed.
    pub failed: AtomicU64,
}

impl BusStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        crate::utils::metrics::BUS_PUBLISH_TOTAL.add(1, &[]);
    }

    pub(crate) fn record_buffered(&self) {
        self.buffered.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        crate::utils::metrics::BUS_BUFFERED_TOTAL.add(1, &[]);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        crate::utils::metrics::BUS_DROPPED_TOTAL.add(1, &[]);
    }

    pub(crate) fn record_flushed(&self) {
        self.flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        crate::utils::metrics::BUS_CONSUME_TOTAL.add(1, &[]);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        crate::utils::metrics::HANDLER_FAILED_TOTAL.add(1, &[]);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Point-in-time view for a status/metrics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: ConnectionState,
    pub buffer_depth: usize,
    pub buffer_capacity: usize,
    pub published: u64,
    pub buffered: u64,
    pub dropped: u64,
    pub flushed: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl StatusReport {
    pub fn new(
        state: ConnectionState,
        buffer_depth: usize,
        buffer_capacity: usize,
        stats: &BusStats,
    ) -> Self {
        Self {
            state,
            buffer_depth,
            buffer_capacity,
            published: stats.published(),
            buffered: stats.buffered(),
            dropped: stats.dropped(),
            flushed: stats.flushed(),
            delivered: stats.delivered(),
            failed: stats.failed(),
        }
    }
}
