//! Additive statistics sink: hit/miss/expiry, leader/waiter, per-worker busy
//! time, and multipart retry counters, aggregated into a snapshot loggable
//! on unmount or `SIGUSR1` — no registry of trait-object writers, just
//! atomics behind one struct.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_expiries: AtomicU64,
    pub single_flight_leaders: AtomicU64,
    pub single_flight_waiters: AtomicU64,
    pub part_retries: AtomicU64,
    pub bytes_downloaded: AtomicU64,
    pub bytes_uploaded: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_expiries: u64,
    pub single_flight_leaders: u64,
    pub single_flight_waiters: u64,
    pub part_retries: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

impl Stats {
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_expiry(&self) {
        self.cache_expiries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_single_flight_leader(&self) {
        self.single_flight_leaders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_single_flight_waiter(&self) {
        self.single_flight_waiters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_part_retry(&self) {
        self.part_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_downloaded(&self, n: u64) {
        self.bytes_downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_bytes_uploaded(&self, n: u64) {
        self.bytes_uploaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_expiries: self.cache_expiries.load(Ordering::Relaxed),
            single_flight_leaders: self.single_flight_leaders.load(Ordering::Relaxed),
            single_flight_waiters: self.single_flight_waiters.load(Ordering::Relaxed),
            part_retries: self.part_retries.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        }
    }

    pub fn log_snapshot(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            cache_expiries = snapshot.cache_expiries,
            single_flight_leaders = snapshot.single_flight_leaders,
            single_flight_waiters = snapshot.single_flight_waiters,
            part_retries = snapshot.part_retries,
            bytes_downloaded = snapshot.bytes_downloaded,
            bytes_uploaded = snapshot.bytes_uploaded,
            "statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = Stats::default();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_miss();
        stats.record_bytes_downloaded(1024);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.bytes_downloaded, 1024);
    }
}
