use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters shared by the ingestion loop and the accumulator.
#[derive(Debug, Default)]
pub struct EngineStats {
    events_read: AtomicU64,
    dropped_unrouted: AtomicU64,
    dropped_persistence: AtomicU64,
    decode_failures: AtomicU64,
    admitted: AtomicU64,
    batches_published: AtomicU64,
    publish_failures: AtomicU64,
}

/// Point-in-time copy of `EngineStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_read: u64,
    pub dropped_unrouted: u64,
    pub dropped_persistence: u64,
    pub decode_failures: u64,
    pub admitted: u64,
    pub batches_published: u64,
    pub publish_failures: u64,
}

impl EngineStats {
    pub fn record_event(&self) {
        self.events_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unrouted(&self) {
        self.dropped_unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.dropped_persistence.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admit(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.batches_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_read: self.events_read.load(Ordering::Relaxed),
            dropped_unrouted: self.dropped_unrouted.load(Ordering::Relaxed),
            dropped_persistence: self.dropped_persistence.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            batches_published: self.batches_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "events={} admitted={} unrouted={} persist_failed={} decode_failed={} batches={} publish_failed={}",
            self.events_read,
            self.admitted,
            self.dropped_unrouted,
            self.dropped_persistence,
            self.decode_failures,
            self.batches_published,
            self.publish_failures
        )
    }
}
