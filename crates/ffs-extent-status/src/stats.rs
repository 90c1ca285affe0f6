//! Per-filesystem statistics block.
//!
//! Counters touched on every lookup are sharded across cache-line padded
//! atomics and summed on read. The scan-time fields are written only by the
//! reclaim path and stay plain atomics.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Upper bound on shards per counter.
pub const MAX_STAT_SHARDS: usize = 64;

/// Padding wrapper that gives its contents a cache line of their own.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Shard selection ─────────────────────────────────────────────────────────

static NEXT_SHARD_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Stable per-thread hint; threads are dealt out round-robin.
fn shard_hint() -> usize {
    SHARD_HINT.with(|hint| {
        if let Some(h) = hint.get() {
            return h;
        }
        let h = NEXT_SHARD_HINT.fetch_add(1, Ordering::Relaxed);
        hint.set(Some(h));
        h
    })
}

// ── Sharded counter ─────────────────────────────────────────────────────────

/// Signed counter split across shards. `sum()` is exact once writers quiesce.
#[derive(Debug)]
pub struct ShardedCounter {
    shards: Box<[CacheLinePadded<AtomicI64>]>,
}

impl ShardedCounter {
    #[must_use]
    pub fn new(shards: usize) -> Self {
        let n = shards.clamp(1, MAX_STAT_SHARDS);
        Self {
            shards: (0..n).map(|_| CacheLinePadded(AtomicI64::new(0))).collect(),
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    pub fn add(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let idx = shard_hint() % self.shards.len();
        self.shards[idx].0.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    #[must_use]
    pub fn sum(&self) -> i64 {
        self.shards
            .iter()
            .map(|s| s.0.load(Ordering::Relaxed))
            .fold(0_i64, i64::wrapping_add)
    }

    /// Sum clamped at zero. Concurrent readers can observe a transiently
    /// negative total while a decrement lands on another shard first.
    #[must_use]
    pub fn sum_clamped(&self) -> u64 {
        u64::try_from(self.sum()).unwrap_or(0)
    }
}

/// Record-count delta as a signed counter increment.
#[must_use]
pub(crate) fn signed_delta(added: usize, removed: usize) -> i64 {
    let added = i64::try_from(added).unwrap_or(i64::MAX);
    let removed = i64::try_from(removed).unwrap_or(i64::MAX);
    added - removed
}

// ── Statistics block ────────────────────────────────────────────────────────

/// Counters for one filesystem instance.
#[derive(Debug)]
pub struct EsStats {
    records: ShardedCounter,
    reclaimable: ShardedCounter,
    hits: ShardedCounter,
    misses: ShardedCounter,
    shrunk: AtomicU64,
    last_scan_ns: AtomicU64,
    avg_scan_ns: AtomicU64,
    max_scan_ns: AtomicU64,
    scans: AtomicU64,
}

impl EsStats {
    #[must_use]
    pub fn new(shards: usize) -> Self {
        Self {
            records: ShardedCounter::new(shards),
            reclaimable: ShardedCounter::new(shards),
            hits: ShardedCounter::new(shards),
            misses: ShardedCounter::new(shards),
            shrunk: AtomicU64::new(0),
            last_scan_ns: AtomicU64::new(0),
            avg_scan_ns: AtomicU64::new(0),
            max_scan_ns: AtomicU64::new(0),
            scans: AtomicU64::new(0),
        }
    }

    pub(crate) fn adjust(&self, records: i64, reclaimable: i64) {
        self.records.add(records);
        self.reclaimable.add(reclaimable);
    }

    pub(crate) fn record_hit(&self) {
        self.hits.inc();
    }

    pub(crate) fn record_miss(&self) {
        self.misses.inc();
    }

    pub(crate) fn record_shrunk(&self, evicted: usize) {
        self.shrunk
            .fetch_add(u64::try_from(evicted).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Fold one scan duration into last/avg/max.
    ///
    /// The average is `(new + 3 * old) / 4`.
    pub(crate) fn record_scan(&self, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let first = self.scans.fetch_add(1, Ordering::Relaxed) == 0;
        self.last_scan_ns.store(ns, Ordering::Relaxed);
        self.max_scan_ns.fetch_max(ns, Ordering::Relaxed);
        // The closure never returns None.
        let _ = self
            .avg_scan_ns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                if first {
                    Some(ns)
                } else {
                    Some(ns.saturating_add(old.saturating_mul(3)) / 4)
                }
            });
    }

    /// Live records across all trees.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records.sum_clamped()
    }

    /// Live Written and Hole records across all trees.
    #[must_use]
    pub fn reclaimable(&self) -> u64 {
        self.reclaimable.sum_clamped()
    }

    #[must_use]
    pub fn snapshot(&self, trees: usize) -> EsStatsSnapshot {
        EsStatsSnapshot {
            records: self.records(),
            reclaimable: self.reclaimable(),
            shrunk: self.shrunk.load(Ordering::Relaxed),
            cache_hits: self.hits.sum_clamped(),
            cache_misses: self.misses.sum_clamped(),
            last_scan_ns: self.last_scan_ns.load(Ordering::Relaxed),
            avg_scan_ns: self.avg_scan_ns.load(Ordering::Relaxed),
            max_scan_ns: self.max_scan_ns.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            trees,
        }
    }
}

/// Point-in-time copy of [`EsStats`] for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EsStatsSnapshot {
    pub records: u64,
    pub reclaimable: u64,
    pub shrunk: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub last_scan_ns: u64,
    pub avg_scan_ns: u64,
    pub max_scan_ns: u64,
    pub scans: u64,
    pub trees: usize,
}

impl EsStatsSnapshot {
    /// Lookup hit rate as a fraction [0.0, 1.0].
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }

    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.cache_hits + self.cache_misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn padded_shards_are_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<CacheLinePadded<AtomicI64>>(), 64);
        let counter = ShardedCounter::new(4);
        for shard in counter.shards.iter() {
            let ptr = std::ptr::addr_of!(*shard) as usize;
            assert_eq!(ptr % 64, 0);
        }
    }

    #[test]
    fn shard_count_is_clamped() {
        assert_eq!(ShardedCounter::new(0).shard_count(), 1);
        assert_eq!(ShardedCounter::new(1000).shard_count(), MAX_STAT_SHARDS);
    }

    #[test]
    fn concurrent_increments_sum_exactly() {
        let counter = Arc::new(ShardedCounter::new(8));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                s.spawn(move || {
                    for _ in 0..1000 {
                        counter.inc();
                    }
                    for _ in 0..250 {
                        counter.add(-1);
                    }
                });
            }
        });
        assert_eq!(counter.sum(), 8 * 750);
    }

    #[test]
    fn negative_sum_clamps_to_zero() {
        let counter = ShardedCounter::new(2);
        counter.add(-5);
        assert_eq!(counter.sum(), -5);
        assert_eq!(counter.sum_clamped(), 0);
    }

    #[test]
    fn scan_average_weights_history() {
        let stats = EsStats::new(1);
        stats.record_scan(Duration::from_nanos(400));
        let snap = stats.snapshot(0);
        assert_eq!(snap.avg_scan_ns, 400, "first sample seeds the average");

        stats.record_scan(Duration::from_nanos(800));
        let snap = stats.snapshot(0);
        assert_eq!(snap.last_scan_ns, 800);
        assert_eq!(snap.avg_scan_ns, 200 + 300);
        assert_eq!(snap.max_scan_ns, 800);

        stats.record_scan(Duration::from_nanos(100));
        let snap = stats.snapshot(0);
        assert_eq!(snap.max_scan_ns, 800, "max is sticky");
        assert_eq!(snap.scans, 3);
        assert_eq!(snap.avg_scan_ns, (100 + 3 * 500) / 4);
    }

    #[test]
    fn scan_average_rounds_after_weighting() {
        let stats = EsStats::new(1);
        stats.record_scan(Duration::from_nanos(5));
        stats.record_scan(Duration::from_nanos(3));
        // (3 + 15) / 4, not 3/4 + (5/4)*3.
        assert_eq!(stats.snapshot(0).avg_scan_ns, 4);

        stats.record_scan(Duration::from_nanos(u64::MAX));
        stats.record_scan(Duration::from_nanos(u64::MAX));
        assert_eq!(stats.snapshot(0).avg_scan_ns, u64::MAX / 4);
    }

    #[test]
    fn hit_rate_handles_empty() {
        let snap = EsStatsSnapshot::default();
        assert!(snap.hit_rate().abs() < f64::EPSILON);

        let stats = EsStats::new(2);
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        let snap = stats.snapshot(1);
        assert_eq!(snap.lookups(), 4);
        assert!((snap.hit_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let stats = EsStats::new(1);
        stats.adjust(3, 2);
        stats.record_shrunk(1);
        let snap = stats.snapshot(5);
        let json = serde_json::to_string(&snap).expect("serialize");
        assert!(json.contains("\"records\":3"));
        assert!(json.contains("\"trees\":5"));
        let back: EsStatsSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, snap);
    }

    #[test]
    fn signed_delta_handles_both_directions() {
        assert_eq!(signed_delta(3, 1), 2);
        assert_eq!(signed_delta(0, 4), -4);
    }
}
