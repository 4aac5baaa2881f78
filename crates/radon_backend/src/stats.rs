use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const WINDOW_SECS: usize = 60;

/// Per-second statement counts over the last minute.
pub struct QueryRates {
    total: AtomicU64,
    start: Instant,
    buckets: Mutex<[(u64, u64); WINDOW_SECS]>,
}

impl Default for QueryRates {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRates {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            start: Instant::now(),
            buckets: Mutex::new([(u64::MAX, 0); WINDOW_SECS]),
        }
    }

    fn now_sec(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn incr(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let sec = self.now_sec();
        let mut buckets = self.buckets.lock();
        let slot = &mut buckets[(sec as usize) % WINDOW_SECS];
        if slot.0 != sec {
            *slot = (sec, 0);
        }
        slot.1 += 1;
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Statements counted over the trailing `window` (capped at one minute).
    pub fn count_within(&self, window: Duration) -> u64 {
        let now = self.now_sec();
        let span = (window.as_secs().max(1) as usize).min(WINDOW_SECS) as u64;
        self.buckets
            .lock()
            .iter()
            .filter(|(sec, _)| *sec != u64::MAX && *sec + span > now && *sec <= now)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn per_second(&self) -> u64 {
        self.count_within(Duration::from_secs(1))
    }

    pub fn per_minute(&self) -> u64 {
        self.count_within(Duration::from_secs(60))
    }
}

/// Lifetime transaction counters, surfaced by `SHOW TXNZ` and `SHOW STATUS`.
#[derive(Default)]
pub struct TxnCounters {
    created: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    aborted: AtomicU64,
    xa_committed: AtomicU64,
    xa_rolled_back: AtomicU64,
    xa_commit_errors: AtomicU64,
    timeouts: AtomicU64,
    active: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnCountersSnapshot {
    pub created: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub aborted: u64,
    pub xa_committed: u64,
    pub xa_rolled_back: u64,
    pub xa_commit_errors: u64,
    pub timeouts: u64,
    pub active: u64,
}

impl TxnCounters {
    pub fn created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }
    pub fn finished(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
    pub fn committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn rolled_back(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }
    pub fn aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn xa_committed(&self) {
        self.xa_committed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn xa_rolled_back(&self) {
        self.xa_rolled_back.fetch_add(1, Ordering::Relaxed);
    }
    pub fn xa_commit_error(&self) {
        self.xa_commit_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TxnCountersSnapshot {
        TxnCountersSnapshot {
            created: self.created.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            xa_committed: self.xa_committed.load(Ordering::Relaxed),
            xa_rolled_back: self.xa_rolled_back.load(Ordering::Relaxed),
            xa_commit_errors: self.xa_commit_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_count_recent() {
        let r = QueryRates::new();
        for _ in 0..5 {
            r.incr();
        }
        assert_eq!(r.total(), 5);
        assert_eq!(r.per_minute(), 5);
        assert!(r.per_second() <= 5);
    }

    #[test]
    fn test_active_never_underflows() {
        let c = TxnCounters::default();
        c.finished();
        c.created();
        c.finished();
        c.finished();
        assert_eq!(c.snapshot().active, 0);
        assert_eq!(c.snapshot().created, 1);
    }
}
