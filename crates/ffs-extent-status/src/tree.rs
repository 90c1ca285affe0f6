//! Per-file extent-status tree.
//!
//! Records live in a generation-checked arena and are indexed by their first
//! logical block in a `BTreeMap`. The tree upholds, after every mutation:
//!
//! - no two records overlap,
//! - no two adjacent records are mergeable (maximally merged form),
//! - the index, the arena and the reclaimable count agree.
//!
//! Every mutation is split into a pure planning step and an apply step.
//! Planning validates the resulting window against the surviving records, so
//! a bad plan is rejected before anything changes. The caller reserves record
//! storage between the two steps; see `cache.rs`.
//!
//! The most-recently-used slot is a packed `(slot, generation)` handle. A
//! freed slot bumps its generation, so a stale handle can never resolve.

use crate::status::{EsStatus, ExtentStatus};
use ffs_error::{FfsError, Result};
use ffs_types::LogicalRange;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

const MRU_NONE: u64 = u64::MAX;

fn pack_handle(slot: u32, generation: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(slot)
}

#[expect(clippy::cast_possible_truncation)] // both halves are 32-bit by construction
fn unpack_handle(handle: u64) -> (u32, u32) {
    (handle as u32, (handle >> 32) as u32)
}

fn invariant(lblk: u32, detail: impl Into<String>) -> FfsError {
    FfsError::InvariantViolation {
        lblk,
        detail: detail.into(),
    }
}

// ── Nodes ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct EsNode {
    /// `extent.referenced` is unused; the live flag is `referenced`.
    extent: ExtentStatus,
    referenced: AtomicBool,
}

impl EsNode {
    fn new(extent: ExtentStatus) -> Self {
        Self {
            referenced: AtomicBool::new(extent.referenced),
            extent: ExtentStatus {
                referenced: false,
                ..extent
            },
        }
    }

    fn snapshot(&self) -> ExtentStatus {
        ExtentStatus {
            referenced: self.referenced.load(Ordering::Relaxed),
            ..self.extent
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<EsNode>,
}

// ── Plans and deltas ────────────────────────────────────────────────────────

/// A validated mutation, bound to the tree version it was planned against.
#[derive(Debug, Clone)]
pub struct TreePlan {
    version: u64,
    anchor: u32,
    remove: Vec<u32>,
    create: Vec<ExtentStatus>,
    focus: Option<u32>,
    over_deleted: bool,
}

impl TreePlan {
    /// New records this plan needs beyond the ones it frees.
    #[must_use]
    pub fn needed(&self) -> usize {
        self.create.len().saturating_sub(self.remove.len())
    }

    /// Whether a straddling record is dropped whole instead of split.
    #[must_use]
    pub fn over_deletes(&self) -> bool {
        self.over_deleted
    }
}

/// Net effect of one applied mutation on the record population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeDelta {
    pub created: usize,
    pub freed: usize,
    /// Change in Written + Hole records.
    pub reclaimable: i64,
}

impl TreeDelta {
    #[must_use]
    pub fn records(&self) -> i64 {
        crate::stats::signed_delta(self.created, self.freed)
    }

    fn note_created(&mut self, status: EsStatus) {
        self.created += 1;
        if status.is_reclaimable() {
            self.reclaimable += 1;
        }
    }

    fn note_freed(&mut self, status: EsStatus) {
        self.freed += 1;
        if status.is_reclaimable() {
            self.reclaimable -= 1;
        }
    }
}

/// Outcome of one CLOCK sweep over a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
    pub evicted: usize,
    pub spared: usize,
    pub scanned: usize,
    pub delta: TreeDelta,
}

// ── Tree ────────────────────────────────────────────────────────────────────

/// Ordered set of non-overlapping extent-status records for one file.
#[derive(Debug)]
pub struct EsTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: BTreeMap<u32, u32>,
    mru: AtomicU64,
    shrink_lblk: u32,
    nr_reclaimable: usize,
    version: u64,
}

impl Default for EsTree {
    fn default() -> Self {
        Self::new()
    }
}

impl EsTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: BTreeMap::new(),
            mru: AtomicU64::new(MRU_NONE),
            shrink_lblk: 0,
            nr_reclaimable: 0,
            version: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Written + Hole records currently in the tree.
    #[must_use]
    pub fn nr_reclaimable(&self) -> usize {
        self.nr_reclaimable
    }

    /// Logical block the next reclaim sweep starts from.
    #[must_use]
    pub fn shrink_cursor(&self) -> u32 {
        self.shrink_lblk
    }

    /// Ordered snapshot of every record.
    #[must_use]
    pub fn extents(&self) -> Vec<ExtentStatus> {
        self.index
            .values()
            .filter_map(|&slot| self.node(slot).map(EsNode::snapshot))
            .collect()
    }

    // ── Arena ──

    fn node(&self, slot: u32) -> Option<&EsNode> {
        self.slots.get(slot as usize)?.node.as_ref()
    }

    fn extent_at(&self, key: u32, slot: u32) -> Result<ExtentStatus> {
        self.node(slot)
            .map(EsNode::snapshot)
            .ok_or_else(|| invariant(key, format!("index points at empty slot {slot}")))
    }

    fn alloc_slot(&mut self, extent: ExtentStatus) -> u32 {
        let node = Some(EsNode::new(extent));
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize].node = node;
            return slot;
        }
        let slot = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            node,
        });
        slot
    }

    fn free_slot(&mut self, slot: u32) -> Option<EsNode> {
        let entry = self.slots.get_mut(slot as usize)?;
        let node = entry.node.take()?;
        let stale = pack_handle(slot, entry.generation);
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
        // Only clear the slot if it still names the freed node.
        let _ = self
            .mru
            .compare_exchange(stale, MRU_NONE, Ordering::Relaxed, Ordering::Relaxed);
        Some(node)
    }

    // ── MRU slot ──

    fn set_mru(&self, slot: u32) {
        if let Some(entry) = self.slots.get(slot as usize) {
            self.mru
                .store(pack_handle(slot, entry.generation), Ordering::Relaxed);
        }
    }

    fn mru_node(&self) -> Option<(u32, &EsNode)> {
        let handle = self.mru.load(Ordering::Relaxed);
        if handle == MRU_NONE {
            return None;
        }
        let (slot, generation) = unpack_handle(handle);
        let entry = self.slots.get(slot as usize)?;
        if entry.generation != generation {
            return None;
        }
        entry.node.as_ref().map(|node| (slot, node))
    }

    /// Record currently held by the most-recently-used slot.
    #[must_use]
    pub fn cached(&self) -> Option<ExtentStatus> {
        self.mru_node().map(|(_, node)| node.snapshot())
    }

    // ── Queries ──

    /// Record containing `lblk`. Sets its referenced flag and caches it.
    ///
    /// Takes `&self`: the flag and the MRU slot are atomics, so concurrent
    /// readers under a shared lock may call this.
    #[must_use]
    pub fn lookup(&self, lblk: u32) -> Option<ExtentStatus> {
        if let Some((_, node)) = self.mru_node().filter(|(_, n)| n.extent.contains(lblk)) {
            node.referenced.store(true, Ordering::Relaxed);
            trace!(target: "ffs::es", event = "lookup_mru_hit", lblk);
            return Some(node.snapshot());
        }
        let (_, &slot) = self.index.range(..=lblk).next_back()?;
        let node = self.node(slot)?;
        if !node.extent.contains(lblk) {
            return None;
        }
        node.referenced.store(true, Ordering::Relaxed);
        self.set_mru(slot);
        Some(node.snapshot())
    }

    /// First Delayed record intersecting `window`, clipped to it.
    #[must_use]
    pub fn find_delayed(&self, window: LogicalRange) -> Option<ExtentStatus> {
        let before = self
            .index
            .range(..window.start())
            .next_back()
            .map(|(_, &slot)| slot);
        let within = self
            .index
            .range(window.start()..=window.end())
            .map(|(_, &slot)| slot);
        for slot in before.into_iter().chain(within) {
            let Some(node) = self.node(slot) else {
                continue;
            };
            if node.extent.status != EsStatus::Delayed {
                continue;
            }
            if let Some(clipped) = node.snapshot().clipped(window) {
                self.set_mru(slot);
                return Some(clipped);
            }
        }
        None
    }

    fn overlapping(&self, window: LogicalRange) -> Result<Vec<(u32, ExtentStatus)>> {
        let mut out = Vec::new();
        if let Some((&key, &slot)) = self.index.range(..window.start()).next_back() {
            let es = self.extent_at(key, slot)?;
            if es.range().is_some_and(|r| r.overlaps(window)) {
                out.push((slot, es));
            }
        }
        for (&key, &slot) in self.index.range(window.start()..=window.end()) {
            out.push((slot, self.extent_at(key, slot)?));
        }
        Ok(out)
    }

    /// Whether any record intersects `window`.
    #[must_use]
    pub fn overlaps(&self, window: LogicalRange) -> bool {
        let left = self
            .index
            .range(..window.start())
            .next_back()
            .and_then(|(_, &slot)| self.node(slot))
            .and_then(|node| node.extent.range())
            .is_some_and(|r| r.overlaps(window));
        left || self.index.range(window.start()..=window.end()).next().is_some()
    }

    // ── Planning ──

    /// Plan making `extent`'s range report exactly `extent`.
    pub fn plan_insert(&self, extent: ExtentStatus) -> Result<TreePlan> {
        let window = extent.range().ok_or_else(|| {
            invariant(extent.lblk, format!("unrepresentable insert of len {}", extent.len))
        })?;
        let new = ExtentStatus {
            referenced: false,
            ..extent
        };
        self.plan_replace(window, Some(new), true)
    }

    /// Plan dropping all knowledge of `window`.
    ///
    /// With `allow_split == false`, a record straddling both ends of the
    /// window is dropped whole so the plan never needs a new record.
    pub fn plan_remove(&self, window: LogicalRange, allow_split: bool) -> Result<TreePlan> {
        self.plan_replace(window, None, allow_split)
    }

    fn plan_replace(
        &self,
        window: LogicalRange,
        new: Option<ExtentStatus>,
        allow_split: bool,
    ) -> Result<TreePlan> {
        let overlapped = self.overlapping(window)?;
        let mut remove: Vec<u32> = overlapped.iter().map(|(slot, _)| *slot).collect();
        let mut pieces: Vec<ExtentStatus> = Vec::with_capacity(3);

        if let Some((_, first)) = overlapped.first().filter(|(_, f)| f.lblk < window.start()) {
            pieces.push(ExtentStatus {
                len: window.start() - first.lblk,
                ..*first
            });
        }
        if let Some(new) = new {
            pieces.push(new);
        }
        if let Some((_, last)) = overlapped.last().filter(|(_, l)| l.end() > window.end()) {
            let offset = window.end() - last.lblk + 1;
            pieces.push(ExtentStatus {
                lblk: window.end() + 1,
                len: last.len - offset,
                pblk: last.pblk_offset(offset),
                ..*last
            });
        }

        let mut over_deleted = false;
        if !allow_split && pieces.len() > remove.len() {
            // Only a single straddling record can demand growth on remove.
            pieces.clear();
            over_deleted = true;
        }

        self.absorb_neighbours(&mut pieces, &mut remove)?;
        let pieces = coalesce(pieces);
        self.validate(window.start(), &pieces, &remove)?;

        let focus = new.and_then(|n| pieces.iter().find(|p| p.contains(n.lblk)).map(|p| p.lblk));
        Ok(TreePlan {
            version: self.version,
            anchor: window.start(),
            remove,
            create: pieces,
            focus,
            over_deleted,
        })
    }

    /// Pull mergeable outer neighbours into the window.
    fn absorb_neighbours(
        &self,
        pieces: &mut Vec<ExtentStatus>,
        remove: &mut Vec<u32>,
    ) -> Result<()> {
        let (Some(first), Some(last)) = (pieces.first().copied(), pieces.last().copied()) else {
            return Ok(());
        };
        if let Some((&key, &slot)) = self.index.range(..first.lblk).next_back() {
            let left = self.extent_at(key, slot)?;
            if !remove.contains(&slot) && left.can_merge(&first) {
                pieces.insert(0, left);
                remove.push(slot);
            }
        }
        if let Some(after) = last.end().checked_add(1) {
            if let Some((&key, &slot)) = self.index.range(after..).next() {
                let right = self.extent_at(key, slot)?;
                if !remove.contains(&slot) && last.can_merge(&right) {
                    pieces.push(right);
                    remove.push(slot);
                }
            }
        }
        Ok(())
    }

    fn validate(&self, anchor: u32, pieces: &[ExtentStatus], remove: &[u32]) -> Result<()> {
        for piece in pieces {
            if piece.range().is_none() {
                return Err(invariant(
                    anchor,
                    format!("empty or overflowing record at lblk {} len {}", piece.lblk, piece.len),
                ));
            }
        }
        for pair in pieces.windows(2) {
            if pair[0].end() >= pair[1].lblk {
                return Err(invariant(
                    anchor,
                    format!(
                        "planned records [{}, {}] and [{}, {}] overlap",
                        pair[0].lblk,
                        pair[0].end(),
                        pair[1].lblk,
                        pair[1].end()
                    ),
                ));
            }
        }
        let (Some(first), Some(last)) = (pieces.first(), pieces.last()) else {
            return Ok(());
        };
        let survivor_before = self
            .index
            .range(..first.lblk)
            .rev()
            .find(|(_, slot)| !remove.contains(slot));
        if let Some((&key, &slot)) = survivor_before {
            let left = self.extent_at(key, slot)?;
            if left.end() >= first.lblk {
                return Err(invariant(
                    anchor,
                    format!("surviving record [{}, {}] overlaps plan", left.lblk, left.end()),
                ));
            }
        }
        let survivor_after = self
            .index
            .range(first.lblk..)
            .find(|(_, slot)| !remove.contains(slot));
        if let Some((&key, _)) = survivor_after {
            if key <= last.end() {
                return Err(invariant(
                    anchor,
                    format!("surviving record at lblk {key} overlaps plan ending {}", last.end()),
                ));
            }
        }
        Ok(())
    }

    // ── Apply ──

    /// Apply a plan produced against this exact tree state.
    ///
    /// Fails without side effects if the tree changed since planning or the
    /// arena cannot grow.
    pub fn apply(&mut self, plan: TreePlan) -> Result<TreeDelta> {
        if plan.version != self.version {
            return Err(invariant(plan.anchor, "tree changed between plan and apply"));
        }
        let reusable = self.free.len() + plan.remove.len();
        let grow = plan.create.len().saturating_sub(reusable);
        self.slots.try_reserve(grow).map_err(|_| FfsError::NoMemory)?;

        let mut delta = TreeDelta::default();
        for slot in plan.remove {
            if let Some(node) = self.free_slot(slot) {
                self.index.remove(&node.extent.lblk);
                delta.note_freed(node.extent.status);
            }
        }
        for extent in plan.create {
            let slot = self.alloc_slot(extent);
            self.index.insert(extent.lblk, slot);
            delta.note_created(extent.status);
            if plan.focus == Some(extent.lblk) {
                self.set_mru(slot);
            }
        }
        self.finish(&delta);
        trace!(
            target: "ffs::es",
            event = "tree_apply",
            lblk = plan.anchor,
            created = delta.created,
            freed = delta.freed
        );
        Ok(delta)
    }

    fn finish(&mut self, delta: &TreeDelta) {
        let reclaimable =
            i64::try_from(self.nr_reclaimable).unwrap_or(i64::MAX) + delta.reclaimable;
        self.nr_reclaimable = usize::try_from(reclaimable).unwrap_or(0);
        self.version = self.version.wrapping_add(1);
    }

    /// Plan and apply an insert that needs no allocator bookkeeping.
    pub fn insert(&mut self, extent: ExtentStatus) -> Result<TreeDelta> {
        let plan = self.plan_insert(extent)?;
        self.apply(plan)
    }

    /// Plan and apply a remove, splitting straddling records.
    pub fn remove(&mut self, window: LogicalRange) -> Result<TreeDelta> {
        let plan = self.plan_remove(window, true)?;
        self.apply(plan)
    }

    /// Drop every record.
    pub fn clear(&mut self) -> TreeDelta {
        let slots: Vec<u32> = self.index.values().copied().collect();
        let mut delta = TreeDelta::default();
        for slot in slots {
            if let Some(node) = self.free_slot(slot) {
                delta.note_freed(node.extent.status);
            }
        }
        self.index.clear();
        self.shrink_lblk = 0;
        self.finish(&delta);
        delta
    }

    // ── Reclaim ──

    /// CLOCK sweep evicting up to `nr` unreferenced Written/Hole records.
    ///
    /// Starts at the persisted cursor and wraps at most once. Referenced
    /// records lose their flag and survive this visit. Delayed and Unwritten
    /// records are never touched.
    pub fn reclaim(&mut self, nr: usize) -> ReclaimOutcome {
        let mut outcome = ReclaimOutcome::default();
        if nr == 0 || self.nr_reclaimable == 0 {
            return outcome;
        }
        let start = self.shrink_lblk;
        let mut victims = Vec::new();
        let mut cursor = start;
        let order = self.index.range(start..).chain(self.index.range(..start));
        for (_, &slot) in order {
            let Some(node) = self.node(slot) else {
                continue;
            };
            outcome.scanned += 1;
            cursor = node.extent.end().checked_add(1).unwrap_or(0);
            if !node.extent.status.is_reclaimable() {
                continue;
            }
            if node.referenced.swap(false, Ordering::Relaxed) {
                outcome.spared += 1;
                continue;
            }
            victims.push(slot);
            if victims.len() == nr {
                break;
            }
        }
        if victims.len() < nr {
            // Full lap: resume where this sweep began.
            cursor = start;
        }

        for slot in victims {
            if let Some(node) = self.free_slot(slot) {
                self.index.remove(&node.extent.lblk);
                outcome.delta.note_freed(node.extent.status);
                outcome.evicted += 1;
            }
        }
        self.shrink_lblk = cursor;
        let delta = outcome.delta;
        self.finish(&delta);
        outcome
    }

    // ── Diagnostics ──

    /// Full structural check. `O(n)`.
    pub fn check_invariants(&self) -> Result<()> {
        let live = self.slots.iter().filter(|s| s.node.is_some()).count();
        if live != self.index.len() {
            return Err(invariant(
                0,
                format!("{live} live slots but {} index entries", self.index.len()),
            ));
        }
        let mut reclaimable = 0;
        let mut prev: Option<ExtentStatus> = None;
        for (&key, &slot) in &self.index {
            let es = self.extent_at(key, slot)?;
            if es.lblk != key {
                return Err(invariant(key, format!("slot {slot} holds lblk {}", es.lblk)));
            }
            if es.range().is_none() {
                return Err(invariant(key, format!("record len {} is unrepresentable", es.len)));
            }
            if es.status.is_reclaimable() {
                reclaimable += 1;
            }
            if let Some(p) = prev {
                if p.end() >= es.lblk {
                    return Err(invariant(
                        key,
                        format!(
                            "records [{}, {}] and [{}, {}] overlap",
                            p.lblk,
                            p.end(),
                            es.lblk,
                            es.end()
                        ),
                    ));
                }
                if p.can_merge(&es) {
                    return Err(invariant(
                        key,
                        format!("records at {} and {} should have merged", p.lblk, es.lblk),
                    ));
                }
            }
            prev = Some(es);
        }
        if reclaimable != self.nr_reclaimable {
            return Err(invariant(
                0,
                format!("reclaimable count {} but {reclaimable} found", self.nr_reclaimable),
            ));
        }
        Ok(())
    }
}

/// Merge adjacent compatible pieces left to right.
fn coalesce(pieces: Vec<ExtentStatus>) -> Vec<ExtentStatus> {
    let mut out: Vec<ExtentStatus> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match out.last_mut() {
            Some(last) if last.can_merge(&piece) => last.absorb(&piece),
            _ => out.push(piece),
        }
    }
    out
}
