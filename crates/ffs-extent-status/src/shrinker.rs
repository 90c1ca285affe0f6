//! Reclaim coordinator.
//!
//! The host's memory-pressure mechanism is modelled by two traits: a
//! [`MemoryPressureHost`] accepts [`Shrinker`] registrations and calls them
//! back with a requested count. [`PressureHub`] is the in-process host used
//! by tests and the harness.
//!
//! [`Reclaimer`] performs the sweep itself: a round-robin walk over the tree
//! rotation, a CLOCK pass inside each tree, two passes at most.

use crate::pool::RecordAllocator;
use crate::registry::{TreeId, TreeRegistry};
use crate::stats::EsStats;
use ffs_error::{FfsError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace};

// ── Host seam ───────────────────────────────────────────────────────────────

/// A participant in memory-pressure reclaim.
pub trait Shrinker: Send + Sync {
    /// Objects that a scan could currently free.
    fn count_objects(&self) -> u64;

    /// Try to free up to `nr` objects. Returns how many were freed.
    fn scan_objects(&self, nr: usize) -> usize;
}

/// Handle returned by [`MemoryPressureHost::register_shrinker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ShrinkerId(pub u64);

/// The memory-pressure notification mechanism.
///
/// Hosts hold shrinkers weakly: a dropped cache is never called back even if
/// it failed to unregister.
pub trait MemoryPressureHost: Send + Sync {
    fn register_shrinker(&self, shrinker: Weak<dyn Shrinker>) -> Result<ShrinkerId>;

    /// Returns whether `id` was registered.
    fn unregister_shrinker(&self, id: ShrinkerId) -> bool;
}

// ── In-process host ─────────────────────────────────────────────────────────

#[derive(Default)]
struct HubInner {
    next_id: u64,
    shrinkers: BTreeMap<ShrinkerId, Weak<dyn Shrinker>>,
}

/// In-process [`MemoryPressureHost`] driven by explicit [`PressureHub::signal`]
/// calls.
#[derive(Default)]
pub struct PressureHub {
    inner: Mutex<HubInner>,
    capacity: Option<usize>,
}

impl fmt::Debug for PressureHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PressureHub")
            .field("registered", &self.registered())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl PressureHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A hub that refuses registrations beyond `capacity` live shrinkers.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            capacity: Some(capacity),
        }
    }

    #[must_use]
    pub fn registered(&self) -> usize {
        self.inner.lock().shrinkers.len()
    }

    fn live(&self) -> Vec<Arc<dyn Shrinker>> {
        let mut inner = self.inner.lock();
        inner.shrinkers.retain(|_, weak| weak.strong_count() > 0);
        inner.shrinkers.values().filter_map(Weak::upgrade).collect()
    }

    /// Objects reclaimable across every registered shrinker.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.live().iter().map(|s| s.count_objects()).sum()
    }

    /// Deliver a pressure signal asking for `nr` objects.
    ///
    /// Each shrinker with something to give is asked for what is still
    /// outstanding. Returns the total freed.
    pub fn signal(&self, nr: usize) -> usize {
        let mut freed = 0;
        for shrinker in self.live() {
            if freed >= nr {
                break;
            }
            if shrinker.count_objects() == 0 {
                continue;
            }
            freed += shrinker.scan_objects(nr - freed);
        }
        trace!(target: "ffs::es", event = "pressure_signal", requested = nr, freed);
        freed
    }
}

impl MemoryPressureHost for PressureHub {
    fn register_shrinker(&self, shrinker: Weak<dyn Shrinker>) -> Result<ShrinkerId> {
        let mut inner = self.inner.lock();
        inner.shrinkers.retain(|_, weak| weak.strong_count() > 0);
        if let Some(cap) = self.capacity {
            if inner.shrinkers.len() >= cap {
                return Err(FfsError::Registration(format!(
                    "pressure hub full ({cap} shrinkers)"
                )));
            }
        }
        let id = ShrinkerId(inner.next_id);
        inner.next_id += 1;
        inner.shrinkers.insert(id, shrinker);
        Ok(id)
    }

    fn unregister_shrinker(&self, id: ShrinkerId) -> bool {
        self.inner.lock().shrinkers.remove(&id).is_some()
    }
}

// ── Sweep ───────────────────────────────────────────────────────────────────

/// What one reclaim request accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShrinkOutcome {
    pub requested: usize,
    pub evicted: usize,
    pub spared: usize,
    pub scanned: usize,
    pub trees_visited: usize,
    pub busy_skipped: usize,
    pub passes: usize,
}

/// Borrowed view of one cache's reclaim state.
pub(crate) struct Reclaimer<'a> {
    pub registry: &'a TreeRegistry,
    pub stats: &'a EsStats,
    pub alloc: &'a dyn RecordAllocator,
    pub skip_precached_first: bool,
}

impl Reclaimer<'_> {
    const MAX_PASSES: usize = 2;

    /// Evict up to `nr` records across the rotation, skipping `exclude`.
    ///
    /// Never blocks on a tree lock and never holds the registry lock while
    /// touching a tree. Stops once `nr` records are gone, or after a pass
    /// that made no progress and skipped nothing.
    pub fn shrink(&self, nr: usize, exclude: Option<TreeId>) -> ShrinkOutcome {
        let mut out = ShrinkOutcome {
            requested: nr,
            ..ShrinkOutcome::default()
        };
        if nr == 0 || self.registry.is_empty() {
            return out;
        }
        let started = Instant::now();

        for pass in 0..Self::MAX_PASSES {
            let skip_precached = pass == 0 && self.skip_precached_first;
            let mut progress = false;
            let mut skipped = false;
            out.passes = pass + 1;

            for cell in self.registry.rotation() {
                if out.evicted >= nr {
                    break;
                }
                if Some(cell.id()) == exclude {
                    continue;
                }
                if skip_precached && cell.is_precached() {
                    skipped = true;
                    continue;
                }
                let Some(mut tree) = cell.tree.try_write() else {
                    out.busy_skipped += 1;
                    skipped = true;
                    continue;
                };
                if tree.nr_reclaimable() == 0 {
                    continue;
                }
                let swept = tree.reclaim(nr - out.evicted);
                self.stats
                    .adjust(swept.delta.records(), swept.delta.reclaimable);
                self.alloc.release(swept.delta.freed);
                drop(tree);

                self.registry.advance(cell.id());
                out.trees_visited += 1;
                out.evicted += swept.evicted;
                out.spared += swept.spared;
                out.scanned += swept.scanned;
                progress |= swept.evicted > 0 || swept.spared > 0;
            }

            if out.evicted >= nr || (!progress && !skipped) {
                break;
            }
        }

        let elapsed = started.elapsed();
        self.stats.record_scan(elapsed);
        self.stats.record_shrunk(out.evicted);
        debug!(
            target: "ffs::es",
            event = "es_shrink",
            requested = nr,
            evicted = out.evicted,
            spared = out.spared,
            scanned = out.scanned,
            trees = out.trees_visited,
            busy = out.busy_skipped,
            passes = out.passes,
            elapsed_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::UnboundedRecordPool;
    use crate::registry::TreeCell;
    use crate::status::{EsStatus, ExtentStatus};
    use ffs_types::InodeNumber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        registry: TreeRegistry,
        stats: EsStats,
        alloc: UnboundedRecordPool,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: TreeRegistry::new(),
                stats: EsStats::new(1),
                alloc: UnboundedRecordPool::new(),
            }
        }

        fn reclaimer(&self) -> Reclaimer<'_> {
            self.reclaimer_with(true)
        }

        fn reclaimer_with(&self, skip_precached_first: bool) -> Reclaimer<'_> {
            Reclaimer {
                registry: &self.registry,
                stats: &self.stats,
                alloc: &self.alloc,
                skip_precached_first,
            }
        }

        /// Open a tree holding `n` separate single-block records.
        fn tree_with(&self, ino: u64, n: u32, status: EsStatus) -> Arc<TreeCell> {
            let cell = self.registry.open(InodeNumber(ino));
            let mut tree = cell.tree.write();
            for i in 0..n {
                let delta = tree
                    .insert(ExtentStatus::new(i * 2, 1, u64::from(i) * 10, status))
                    .unwrap();
                self.stats.adjust(delta.records(), delta.reclaimable);
                self.alloc.try_reserve(delta.created).unwrap();
            }
            drop(tree);
            cell
        }
    }

    #[test]
    fn sweep_rotates_across_trees() {
        let fx = Fixture::new();
        let a = fx.tree_with(1, 4, EsStatus::Written);
        let b = fx.tree_with(2, 4, EsStatus::Written);

        let out = fx.reclaimer().shrink(2, None);
        assert_eq!(out.evicted, 2);
        assert_eq!(a.tree.read().len(), 2, "first tree drained first");
        assert_eq!(b.tree.read().len(), 4);

        let out = fx.reclaimer().shrink(2, None);
        assert_eq!(out.evicted, 2);
        assert_eq!(b.tree.read().len(), 2, "next request resumes at the next tree");
        assert_eq!(fx.stats.records(), 4);
        assert_eq!(fx.alloc.in_use(), 4);
    }

    #[test]
    fn second_pass_evicts_spared_records() {
        let fx = Fixture::new();
        let a = fx.tree_with(1, 3, EsStatus::Hole);
        for lblk in [0, 2, 4] {
            a.tree.read().lookup(lblk).unwrap();
        }
        let out = fx.reclaimer().shrink(3, None);
        assert_eq!(out.passes, 2);
        assert_eq!(out.spared, 3);
        assert_eq!(out.evicted, 3);
        assert!(a.tree.read().is_empty());
    }

    #[test]
    fn protected_records_end_the_sweep() {
        let fx = Fixture::new();
        let d = fx.tree_with(1, 5, EsStatus::Delayed);
        let u = fx.tree_with(2, 5, EsStatus::Unwritten);
        let out = fx.reclaimer().shrink(100, None);
        assert_eq!(out.evicted, 0);
        assert_eq!(out.passes, 1);
        assert_eq!(d.tree.read().len(), 5);
        assert_eq!(u.tree.read().len(), 5);
        assert_eq!(fx.stats.snapshot(2).scans, 1);
    }

    #[test]
    fn precached_trees_are_a_last_resort() {
        let fx = Fixture::new();
        let pre = fx.tree_with(1, 2, EsStatus::Written);
        pre.set_precached(true);
        let plain = fx.tree_with(2, 1, EsStatus::Written);

        let out = fx.reclaimer().shrink(2, None);
        assert_eq!(out.evicted, 2);
        assert!(plain.tree.read().is_empty());
        assert_eq!(pre.tree.read().len(), 1);
        assert_eq!(out.passes, 2);
    }

    #[test]
    fn precached_trees_swept_first_when_not_skipped() {
        let fx = Fixture::new();
        let pre = fx.tree_with(1, 2, EsStatus::Written);
        pre.set_precached(true);
        let plain = fx.tree_with(2, 1, EsStatus::Written);

        let out = fx.reclaimer_with(false).shrink(2, None);
        assert_eq!(out.evicted, 2);
        assert_eq!(out.passes, 1);
        assert!(pre.tree.read().is_empty());
        assert_eq!(plain.tree.read().len(), 1);
    }

    #[test]
    fn busy_and_excluded_trees_are_skipped() {
        let fx = Fixture::new();
        let busy = fx.tree_with(1, 2, EsStatus::Written);
        let mine = fx.tree_with(2, 2, EsStatus::Written);
        let free = fx.tree_with(3, 2, EsStatus::Written);

        let guard = busy.tree.read();
        let out = fx.reclaimer().shrink(10, Some(mine.id()));
        drop(guard);
        assert_eq!(out.evicted, 2);
        assert!(out.busy_skipped >= 1);
        assert!(free.tree.read().is_empty());
        assert_eq!(mine.tree.read().len(), 2);
        assert_eq!(busy.tree.read().len(), 2);
    }

    #[test]
    fn shrink_records_statistics() {
        let fx = Fixture::new();
        fx.tree_with(1, 3, EsStatus::Written);
        fx.reclaimer().shrink(2, None);
        let snap = fx.stats.snapshot(1);
        assert_eq!(snap.shrunk, 2);
        assert_eq!(snap.records, 1);
        assert_eq!(snap.reclaimable, 1);
        assert_eq!(snap.scans, 1);
        assert!(snap.max_scan_ns >= snap.last_scan_ns);
    }

    #[test]
    fn zero_request_is_free() {
        let fx = Fixture::new();
        fx.tree_with(1, 3, EsStatus::Written);
        assert_eq!(fx.reclaimer().shrink(0, None).evicted, 0);
        assert_eq!(fx.stats.snapshot(1).scans, 0);
    }

    struct CountingShrinker {
        available: AtomicUsize,
    }

    impl Shrinker for CountingShrinker {
        fn count_objects(&self) -> u64 {
            self.available.load(Ordering::Relaxed) as u64
        }

        fn scan_objects(&self, nr: usize) -> usize {
            let have = self.available.load(Ordering::Relaxed);
            let take = have.min(nr);
            self.available.store(have - take, Ordering::Relaxed);
            take
        }
    }

    fn counting(n: usize) -> Arc<dyn Shrinker> {
        Arc::new(CountingShrinker {
            available: AtomicUsize::new(n),
        })
    }

    #[test]
    fn hub_fans_out_until_satisfied() {
        let hub = PressureHub::new();
        let a = counting(3);
        let b = counting(10);
        hub.register_shrinker(Arc::downgrade(&a)).unwrap();
        hub.register_shrinker(Arc::downgrade(&b)).unwrap();
        assert_eq!(hub.count(), 13);
        assert_eq!(hub.signal(5), 5);
        assert_eq!(a.count_objects(), 0);
        assert_eq!(b.count_objects(), 8);
    }

    #[test]
    fn hub_forgets_dropped_shrinkers() {
        let hub = PressureHub::new();
        let a = counting(3);
        hub.register_shrinker(Arc::downgrade(&a)).unwrap();
        drop(a);
        assert_eq!(hub.signal(5), 0);
        assert_eq!(hub.registered(), 0);
    }

    #[test]
    fn hub_capacity_refuses_registration() {
        let hub = PressureHub::with_capacity(1);
        let a = counting(1);
        let b = counting(1);
        let id = hub.register_shrinker(Arc::downgrade(&a)).unwrap();
        let err = hub.register_shrinker(Arc::downgrade(&b)).unwrap_err();
        assert!(matches!(err, FfsError::Registration(_)));
        assert!(hub.unregister_shrinker(id));
        assert!(!hub.unregister_shrinker(id));
        hub.register_shrinker(Arc::downgrade(&b)).unwrap();
    }
}
