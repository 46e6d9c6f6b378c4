// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostic counters for the channel.
//!
//! Delivery failures are never surfaced to producers, so these counters and
//! the `tracing` output are the only way to observe data loss.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ChannelStats {
    pub(crate) enqueued: AtomicU64,
    pub(crate) dropped_buffer_full: AtomicU64,
    pub(crate) transmissions_sent: AtomicU64,
    pub(crate) transmissions_delivered: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) throttled: AtomicU64,
    pub(crate) dropped_terminal: AtomicU64,
    pub(crate) dropped_serialization: AtomicU64,
    pub(crate) dropped_exhausted: AtomicU64,
    pub(crate) dropped_cancelled: AtomicU64,
    pub(crate) spilled: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) dropped_expired: AtomicU64,
    pub(crate) restored: AtomicU64,
}

/// Point-in-time copy of [`ChannelStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub dropped_buffer_full: u64,
    pub transmissions_sent: u64,
    pub transmissions_delivered: u64,
    pub retries: u64,
    pub throttled: u64,
    pub dropped_terminal: u64,
    pub dropped_serialization: u64,
    pub dropped_exhausted: u64,
    pub dropped_cancelled: u64,
    pub spilled: u64,
    pub evicted: u64,
    pub dropped_expired: u64,
    pub restored: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    add(counter, 1);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl ChannelStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            enqueued: load(&self.enqueued),
            dropped_buffer_full: load(&self.dropped_buffer_full),
            transmissions_sent: load(&self.transmissions_sent),
            transmissions_delivered: load(&self.transmissions_delivered),
            retries: load(&self.retries),
            throttled: load(&self.throttled),
            dropped_terminal: load(&self.dropped_terminal),
            dropped_serialization: load(&self.dropped_serialization),
            dropped_exhausted: load(&self.dropped_exhausted),
            dropped_cancelled: load(&self.dropped_cancelled),
            spilled: load(&self.spilled),
            evicted: load(&self.evicted),
            dropped_expired: load(&self.dropped_expired),
            restored: load(&self.restored),
        }
    }

    /// Transmissions that left the in-memory pipeline without being delivered,
    /// either dropped or handed to the persistence fallback.
    pub(crate) fn undelivered(&self) -> u64 {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        load(&self.dropped_terminal)
            + load(&self.dropped_exhausted)
            + load(&self.dropped_cancelled)
            + load(&self.spilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ChannelStats::default();
        bump(&stats.enqueued);
        bump(&stats.enqueued);
        add(&stats.evicted, 3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.enqueued, 2);
        assert_eq!(snapshot.evicted, 3);
        assert_eq!(snapshot.spilled, 0);
    }

    #[test]
    fn test_undelivered_counts_drops_and_spills() {
        let stats = ChannelStats::default();
        bump(&stats.dropped_terminal);
        bump(&stats.spilled);
        bump(&stats.transmissions_delivered);
        assert_eq!(stats.undelivered(), 2);
    }
}
