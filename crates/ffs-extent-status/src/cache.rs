//! Per-filesystem cache instance and the per-file tree handle.
//!
//! [`ExtentStatusCache`] owns the statistics block, the record allocator and
//! the tree registry of one filesystem instance. Files obtain an
//! [`InodeEsTree`] from [`ExtentStatusCache::open_tree`]; dropping the handle
//! frees the tree's records and delists it from the reclaim rotation.

use crate::pool::{BoundedRecordPool, RecordAllocator, Reservation, UnboundedRecordPool};
use crate::registry::{TreeCell, TreeId, TreeRegistry};
use crate::shrinker::{MemoryPressureHost, Reclaimer, ShrinkOutcome, Shrinker, ShrinkerId};
use crate::stats::{EsStats, EsStatsSnapshot, MAX_STAT_SHARDS};
use crate::status::{ES_PBLK_MAX, EsStatus, ExtentStatus};
use crate::tree::{EsTree, TreeDelta, TreePlan};
use ffs_error::{FfsError, Result};
use ffs_types::{InodeNumber, LogicalRange};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

// ── Configuration ───────────────────────────────────────────────────────────

/// Tunables for one cache instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsConfig {
    /// Shards per statistics counter. `0` picks one per available CPU.
    pub stat_shards: usize,
    /// Record pool capacity. `None` means allocation never fails.
    pub max_records: Option<usize>,
    /// Records to reclaim before retrying a failed allocation.
    pub alloc_retry_reclaim: usize,
    /// Leave precached trees alone on the first reclaim pass.
    pub skip_precached_first: bool,
}

impl Default for EsConfig {
    fn default() -> Self {
        Self {
            stat_shards: 0,
            max_records: None,
            alloc_retry_reclaim: 128,
            skip_precached_first: true,
        }
    }
}

impl EsConfig {
    #[must_use]
    pub fn resolved_shards(&self) -> usize {
        let shards = if self.stat_shards == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            self.stat_shards
        };
        shards.clamp(1, MAX_STAT_SHARDS)
    }
}

// ── Shared state ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CacheShared {
    config: EsConfig,
    stats: EsStats,
    alloc: Arc<dyn RecordAllocator>,
    registry: TreeRegistry,
}

impl CacheShared {
    fn reclaimer(&self) -> Reclaimer<'_> {
        Reclaimer {
            registry: &self.registry,
            stats: &self.stats,
            alloc: self.alloc.as_ref(),
            skip_precached_first: self.config.skip_precached_first,
        }
    }

    /// Charge an applied delta to the counters and the allocator.
    ///
    /// Growth is paid from `reservation`; shrinkage returns storage directly.
    fn settle(&self, delta: &TreeDelta, reservation: Option<Reservation>) -> Result<()> {
        let net = delta.records();
        self.stats.adjust(net, delta.reclaimable);
        if net > 0 {
            let grown = usize::try_from(net).unwrap_or(usize::MAX);
            let mut reservation = reservation.ok_or(FfsError::NoMemory)?;
            reservation.commit(grown)?;
        } else if net < 0 {
            self.alloc.release(usize::try_from(-net).unwrap_or(0));
        }
        Ok(())
    }
}

impl Shrinker for CacheShared {
    fn count_objects(&self) -> u64 {
        self.stats.reclaimable()
    }

    fn scan_objects(&self, nr: usize) -> usize {
        self.reclaimer().shrink(nr, None).evicted
    }
}

struct Registration {
    host: Arc<dyn MemoryPressureHost>,
    id: ShrinkerId,
}

// ── Cache ───────────────────────────────────────────────────────────────────

/// Extent-status cache of one filesystem instance.
pub struct ExtentStatusCache {
    shared: Arc<CacheShared>,
    registration: Mutex<Option<Registration>>,
}

impl fmt::Debug for ExtentStatusCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtentStatusCache")
            .field("config", &self.shared.config)
            .field("trees", &self.shared.registry.len())
            .field("shrinker", &self.registration.lock().as_ref().map(|r| r.id))
            .finish_non_exhaustive()
    }
}

impl ExtentStatusCache {
    /// Create a cache with the allocator `config.max_records` describes.
    #[must_use]
    pub fn new(config: EsConfig) -> Self {
        let alloc: Arc<dyn RecordAllocator> = match config.max_records {
            Some(capacity) => Arc::new(BoundedRecordPool::new(capacity)),
            None => Arc::new(UnboundedRecordPool::new()),
        };
        Self::with_allocator(config, alloc)
    }

    /// Create a cache backed by a caller-supplied allocator.
    #[must_use]
    pub fn with_allocator(config: EsConfig, alloc: Arc<dyn RecordAllocator>) -> Self {
        let shards = config.resolved_shards();
        info!(
            target: "ffs::es",
            event = "es_cache_init",
            shards,
            max_records = ?config.max_records,
            retry_reclaim = config.alloc_retry_reclaim
        );
        Self {
            shared: Arc::new(CacheShared {
                stats: EsStats::new(shards),
                alloc,
                registry: TreeRegistry::new(),
                config,
            }),
            registration: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EsConfig {
        &self.shared.config
    }

    /// Records currently charged to the allocator.
    #[must_use]
    pub fn records_in_use(&self) -> usize {
        self.shared.alloc.in_use()
    }

    /// Create an empty tree for `ino` and add it to the reclaim rotation.
    #[must_use]
    pub fn open_tree(&self, ino: InodeNumber) -> InodeEsTree {
        let cell = self.shared.registry.open(ino);
        debug!(target: "ffs::es", event = "es_tree_open", ino = ino.0, tree = cell.id().0);
        InodeEsTree {
            shared: Arc::clone(&self.shared),
            cell,
        }
    }

    /// Register this cache's shrinker with `host`.
    ///
    /// Fails if already registered or if the host refuses.
    pub fn register_shrinker(&self, host: &Arc<dyn MemoryPressureHost>) -> Result<()> {
        let mut registration = self.registration.lock();
        if let Some(existing) = registration.as_ref() {
            return Err(FfsError::Registration(format!(
                "shrinker already registered as {}",
                existing.id.0
            )));
        }
        let weak: Weak<CacheShared> = Arc::downgrade(&self.shared);
        let weak: Weak<dyn Shrinker> = weak;
        let id = host.register_shrinker(weak)?;
        *registration = Some(Registration {
            host: Arc::clone(host),
            id,
        });
        info!(target: "ffs::es", event = "es_shrinker_register", id = id.0);
        Ok(())
    }

    /// Deregister the shrinker. Returns whether one was registered.
    pub fn unregister_shrinker(&self) -> bool {
        let Some(registration) = self.registration.lock().take() else {
            return false;
        };
        let known = registration.host.unregister_shrinker(registration.id);
        info!(
            target: "ffs::es",
            event = "es_shrinker_unregister",
            id = registration.id.0,
            known
        );
        true
    }

    #[must_use]
    pub fn is_shrinker_registered(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// Evict up to `nr` reclaimable records across all trees.
    pub fn shrink(&self, nr: usize) -> ShrinkOutcome {
        self.shared.reclaimer().shrink(nr, None)
    }

    /// Reclaimable (Written + Hole) records right now.
    #[must_use]
    pub fn reclaimable(&self) -> u64 {
        self.shared.stats.reclaimable()
    }

    #[must_use]
    pub fn stats(&self) -> EsStatsSnapshot {
        self.shared.stats.snapshot(self.shared.registry.len())
    }
}

impl Drop for ExtentStatusCache {
    fn drop(&mut self) {
        self.unregister_shrinker();
    }
}

// ── Per-file handle ─────────────────────────────────────────────────────────

/// The extent-status tree of one open file.
pub struct InodeEsTree {
    shared: Arc<CacheShared>,
    cell: Arc<TreeCell>,
}

impl fmt::Debug for InodeEsTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeEsTree")
            .field("id", &self.cell.id())
            .field("ino", &self.cell.ino())
            .finish_non_exhaustive()
    }
}

fn validate_extent(lblk: u32, len: u32, pblk: u64, status: EsStatus) -> Result<ExtentStatus> {
    let invalid = |reason| FfsError::InvalidExtent { lblk, len, reason };
    if len == 0 {
        return Err(invalid("zero length"));
    }
    if LogicalRange::from_len(lblk, len).is_none() {
        return Err(invalid("logical range overflows block space"));
    }
    if status.is_mapped() {
        let last = pblk.checked_add(u64::from(len - 1));
        if last.is_none_or(|last| last > ES_PBLK_MAX) {
            return Err(invalid("physical block uses reserved high bits"));
        }
    }
    Ok(ExtentStatus::new(lblk, len, pblk, status))
}

impl InodeEsTree {
    #[must_use]
    pub fn id(&self) -> TreeId {
        self.cell.id()
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.cell.ino()
    }

    /// Make `[lblk, lblk + len)` report exactly `status` at `pblk`.
    ///
    /// Existing knowledge of the range is overridden. On `NoMemory` this
    /// tree is unchanged.
    pub fn insert_extent(&self, lblk: u32, len: u32, pblk: u64, status: EsStatus) -> Result<()> {
        let extent = validate_extent(lblk, len, pblk, status)?;
        let mut tree = self.cell.tree.write();
        let (plan, reservation) = self.reserve(&tree, |t| t.plan_insert(extent))?;
        let delta = tree.apply(plan)?;
        self.shared.settle(&delta, Some(reservation))?;
        debug!(
            target: "ffs::es",
            event = "es_insert",
            ino = self.ino().0,
            lblk,
            len,
            pblk = extent.pblk,
            status = ?status,
            created = delta.created,
            freed = delta.freed
        );
        Ok(())
    }

    /// Best-effort insert of mapping state learned from disk.
    ///
    /// Dropped when the range overlaps anything already cached, or when no
    /// record can be allocated. Never reports an error.
    pub fn cache_extent(&self, lblk: u32, len: u32, pblk: u64, status: EsStatus) {
        let extent = match validate_extent(lblk, len, pblk, status) {
            Ok(extent) => extent,
            Err(err) => {
                warn!(
                    target: "ffs::es",
                    event = "es_cache_rejected",
                    ino = self.ino().0,
                    error = %err
                );
                return;
            }
        };
        let Some(window) = extent.range() else {
            return;
        };
        let mut tree = self.cell.tree.write();
        if tree.overlaps(window) {
            trace!(target: "ffs::es", event = "es_cache_overlap", ino = self.ino().0, lblk, len);
            return;
        }
        let applied = tree.plan_insert(extent).and_then(|plan| {
            let reservation = Reservation::new(&self.shared.alloc, plan.needed())?;
            let delta = tree.apply(plan)?;
            self.shared.settle(&delta, Some(reservation))
        });
        if let Err(err) = applied {
            warn!(
                target: "ffs::es",
                event = "es_cache_dropped",
                ino = self.ino().0,
                lblk,
                len,
                error = %err
            );
        }
    }

    /// Forget `[lblk, lblk + len)`. The end saturates at the last block.
    ///
    /// If a split cannot get a new record, the straddling record is dropped
    /// whole and `NoMemory` is returned; the tree stays consistent.
    pub fn remove_extent(&self, lblk: u32, len: u32) -> Result<()> {
        let Some(window) = LogicalRange::from_len_saturating(lblk, len) else {
            return Ok(());
        };
        let mut tree = self.cell.tree.write();
        match self.reserve(&tree, |t| t.plan_remove(window, true)) {
            Ok((plan, reservation)) => {
                let delta = tree.apply(plan)?;
                self.shared.settle(&delta, Some(reservation))?;
                debug!(
                    target: "ffs::es",
                    event = "es_remove",
                    ino = self.ino().0,
                    lblk,
                    end = window.end(),
                    freed = delta.freed
                );
                Ok(())
            }
            Err(FfsError::NoMemory) => {
                let plan = tree.plan_remove(window, false)?;
                let delta = tree.apply(plan)?;
                self.shared.settle(&delta, None)?;
                warn!(
                    target: "ffs::es",
                    event = "es_remove_overdelete",
                    ino = self.ino().0,
                    lblk,
                    end = window.end(),
                    freed = delta.freed
                );
                Err(FfsError::NoMemory)
            }
            Err(err) => Err(err),
        }
    }

    /// Plan a mutation and reserve the records it needs.
    ///
    /// On exhaustion, reclaims from the other trees, then replans and retries
    /// once. The caller's own tree is never reclaimed here, so a failure
    /// leaves it exactly as it was.
    fn reserve(
        &self,
        tree: &EsTree,
        plan: impl Fn(&EsTree) -> Result<TreePlan>,
    ) -> Result<(TreePlan, Reservation)> {
        let first = plan(tree)?;
        match Reservation::new(&self.shared.alloc, first.needed()) {
            Ok(reservation) => return Ok((first, reservation)),
            Err(err) if !err.is_transient() => return Err(err),
            Err(_) => {}
        }

        let wanted = self.shared.config.alloc_retry_reclaim.max(first.needed());
        let others = self.shared.reclaimer().shrink(wanted, Some(self.id()));
        debug!(
            target: "ffs::es",
            event = "es_alloc_retry",
            ino = self.ino().0,
            needed = first.needed(),
            reclaimed = others.evicted,
            busy_skipped = others.busy_skipped
        );

        let retry = plan(tree)?;
        let reservation = Reservation::new(&self.shared.alloc, retry.needed())?;
        Ok((retry, reservation))
    }

    /// Record containing `lblk`, if cached. Counts a hit or a miss.
    #[must_use]
    pub fn lookup_extent(&self, lblk: u32) -> Option<ExtentStatus> {
        let found = self.cell.tree.read().lookup(lblk);
        match found {
            Some(_) => self.shared.stats.record_hit(),
            None => self.shared.stats.record_miss(),
        }
        trace!(
            target: "ffs::es",
            event = "es_lookup",
            ino = self.ino().0,
            lblk,
            hit = found.is_some()
        );
        found
    }

    /// First Delayed record intersecting `[lblk, end]`, clipped to it.
    #[must_use]
    pub fn find_delayed_extent_range(&self, lblk: u32, end: u32) -> Option<ExtentStatus> {
        let window = LogicalRange::new(lblk, end)?;
        self.cell.tree.read().find_delayed(window)
    }

    /// Mark the tree as holding the file's full mapping.
    pub fn set_precached(&self, precached: bool) {
        self.cell.set_precached(precached);
    }

    #[must_use]
    pub fn is_precached(&self) -> bool {
        self.cell.is_precached()
    }

    #[must_use]
    pub fn extents(&self) -> Vec<ExtentStatus> {
        self.cell.tree.read().extents()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cell.tree.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cell.tree.read().is_empty()
    }

    pub fn check_invariants(&self) -> Result<()> {
        self.cell.tree.read().check_invariants()
    }
}

impl Drop for InodeEsTree {
    fn drop(&mut self) {
        self.shared.registry.close(self.cell.id());
        let delta = self.cell.tree.write().clear();
        // Shrinking never needs a reservation.
        let _ = self.shared.settle(&delta, None);
        debug!(
            target: "ffs::es",
            event = "es_tree_close",
            ino = self.ino().0,
            freed = delta.freed
        );
    }
}
