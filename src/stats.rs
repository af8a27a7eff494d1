//! Transport statistics.
//!
//! Counters are plain atomics so deliveries running on different tasks can
//! update them without a lock. They only ever grow for the life of a shipper.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Cumulative delivery counters of one shipper instance.
#[derive(Debug, Default)]
pub struct TransportStats {
    total_sent: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    retry_count: AtomicU64,
    batch_count: AtomicU64,
    // Milliseconds since the epoch, 0 when unset
    last_sent_at: AtomicI64,
    last_error_at: AtomicI64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully delivered batch of `records` entries.
    pub fn record_success(&self, records: usize) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_sent.fetch_add(records as u64, Ordering::Relaxed);
        self.batch_count.fetch_add(1, Ordering::Relaxed);
        self.last_sent_at.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Record a batch that was dropped.
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.last_error_at.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Record one re-attempt of a batch.
    pub fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_sent: self.total_sent.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            batch_count: self.batch_count.load(Ordering::Relaxed),
            last_sent_at: millis_to_time(self.last_sent_at.load(Ordering::Relaxed)),
            last_error_at: millis_to_time(self.last_error_at.load(Ordering::Relaxed)),
        }
    }
}

fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        None
    } else {
        Utc.timestamp_millis_opt(millis).single()
    }
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Records delivered successfully
    pub total_sent: u64,
    pub success_count: u64,
    /// Batches dropped after a terminal error or exhausted retries
    pub failure_count: u64,
    /// Re-attempts across all batches
    pub retry_count: u64,
    pub batch_count: u64,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}
