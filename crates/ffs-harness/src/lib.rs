#![forbid(unsafe_code)]
//! Deterministic workload driver for the extent-status cache.
//!
//! [`run_es_workload`] opens a set of files on one cache, drives a seeded mix
//! of insert / hint / remove / lookup / delayed-range queries against them,
//! raises memory pressure through a [`PressureHub`] and finally checks every
//! tree and the statistics block for consistency.

use anyhow::{Context, Result, anyhow, bail, ensure};
use ffs_error::FfsError;
use ffs_extent_status::{
    EsConfig, EsStatsSnapshot, EsStatus, ExtentStatusCache, InodeEsTree, MemoryPressureHost,
    PressureHub,
};
use ffs_types::InodeNumber;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsWorkloadConfig {
    /// Number of files (one tree each).
    pub files: usize,
    /// Operations per file.
    pub ops: u64,
    pub seed: u64,
    /// Record pool capacity; `None` runs with an unbounded pool.
    pub max_records: Option<usize>,
    /// Signal pressure every this many operations per worker. `0` disables.
    pub pressure_every: u64,
    /// Records requested per pressure signal.
    pub pressure_batch: usize,
    /// Logical blocks touched per file.
    pub logical_span: u32,
    /// Worker threads; files are split round-robin between them.
    pub threads: usize,
}

impl Default for EsWorkloadConfig {
    fn default() -> Self {
        Self {
            files: 8,
            ops: 10_000,
            seed: 0x5EED_0E57,
            max_records: None,
            pressure_every: 256,
            pressure_batch: 64,
            logical_span: 4096,
            threads: 1,
        }
    }
}

impl EsWorkloadConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.files > 0, "files must be at least 1");
        ensure!(self.threads > 0, "threads must be at least 1");
        ensure!(self.logical_span > 0, "logical_span must be at least 1");
        ensure!(
            self.logical_span <= u32::MAX - MAX_LEN,
            "logical_span {} leaves no room for extents",
            self.logical_span
        );
        if let Some(max) = self.max_records {
            ensure!(max > 0, "max_records must be at least 1");
        }
        Ok(())
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

/// Operation tallies for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsOpCounts {
    pub inserts: u64,
    pub hints: u64,
    pub removes: u64,
    pub lookups: u64,
    pub lookup_hits: u64,
    pub delayed_queries: u64,
    pub delayed_found: u64,
    /// Inserts and removes that returned `NoMemory`.
    pub alloc_failures: u64,
    pub pressure_signals: u64,
    /// Records evicted by pressure signals raised from the workers.
    pub pressure_reclaimed: u64,
}

impl AddAssign for EsOpCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserts += rhs.inserts;
        self.hints += rhs.hints;
        self.removes += rhs.removes;
        self.lookups += rhs.lookups;
        self.lookup_hits += rhs.lookup_hits;
        self.delayed_queries += rhs.delayed_queries;
        self.delayed_found += rhs.delayed_found;
        self.alloc_failures += rhs.alloc_failures;
        self.pressure_signals += rhs.pressure_signals;
        self.pressure_reclaimed += rhs.pressure_reclaimed;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsWorkloadReport {
    pub config: EsWorkloadConfig,
    pub counts: EsOpCounts,
    /// Live records across all trees after the run.
    pub final_records: u64,
    /// Pending (Delayed/Unwritten) blocks verified to survive reclaim.
    pub pending_blocks_checked: u64,
    pub elapsed_us: u64,
    pub stats: EsStatsSnapshot,
}

// ── Deterministic generator ─────────────────────────────────────────────────

const MAX_LEN: u32 = 32;

#[derive(Debug, Clone, Copy)]
struct WorkloadRng(u64);

impl WorkloadRng {
    fn new(seed: u64, stream: u64) -> Self {
        Self(seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    #[expect(clippy::cast_possible_truncation)]
    fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 32) as u32
    }

    fn below(&mut self, upper: u32) -> u32 {
        if upper <= 1 {
            return 0;
        }
        self.next_u32() % upper
    }

    fn status(&mut self) -> EsStatus {
        match self.below(4) {
            0 => EsStatus::Written,
            1 => EsStatus::Unwritten,
            2 => EsStatus::Delayed,
            _ => EsStatus::Hole,
        }
    }
}

// ── Per-file ground truth ───────────────────────────────────────────────────

/// What the block-mapping layer "really" holds, block by block.
#[derive(Debug, Default)]
struct Truth {
    blocks: BTreeMap<u32, (EsStatus, u64)>,
    /// A remove over-deleted; blocks outside the removed range may be gone.
    lossy: bool,
}

impl Truth {
    fn insert(&mut self, lblk: u32, len: u32, pblk: u64, status: EsStatus) {
        for off in 0..len {
            let p = if status.is_mapped() {
                pblk + u64::from(off)
            } else {
                0
            };
            self.blocks.insert(lblk + off, (status, p));
        }
    }

    fn remove(&mut self, lblk: u32, len: u32) {
        let end = lblk.saturating_add(len);
        self.blocks.retain(|b, _| *b < lblk || *b >= end);
    }

    fn is_vacant(&self, lblk: u32, len: u32) -> bool {
        self.blocks.range(lblk..lblk + len).next().is_none()
    }

    fn at(&self, lblk: u32) -> (EsStatus, u64) {
        self.blocks.get(&lblk).copied().unwrap_or((EsStatus::Hole, 0))
    }
}

struct FileState {
    tree: InodeEsTree,
    truth: Truth,
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Run the workload and verify the cache afterwards.
///
/// Fails on the first disagreement between a lookup and the ground truth,
/// on any error other than `NoMemory`, and on any tree or statistics
/// inconsistency found at the end.
pub fn run_es_workload(config: &EsWorkloadConfig) -> Result<EsWorkloadReport> {
    config.validate()?;
    let started = Instant::now();

    let hub = Arc::new(PressureHub::new());
    let host: Arc<dyn MemoryPressureHost> = hub.clone();
    let cache = ExtentStatusCache::new(EsConfig {
        stat_shards: config.threads,
        max_records: config.max_records,
        ..EsConfig::default()
    });
    cache
        .register_shrinker(&host)
        .context("registering the cache shrinker")?;

    let mut groups: Vec<Vec<FileState>> = (0..config.threads).map(|_| Vec::new()).collect();
    for file in 0..config.files {
        let ino = InodeNumber(1000 + file as u64);
        groups[file % config.threads].push(FileState {
            tree: cache.open_tree(ino),
            truth: Truth::default(),
        });
    }

    let mut counts = EsOpCounts::default();
    thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = groups
            .iter_mut()
            .enumerate()
            .map(|(worker, files)| {
                let hub = &hub;
                s.spawn(move || drive_worker(config, worker as u64, files, hub))
            })
            .collect();
        for handle in handles {
            let tally = handle
                .join()
                .map_err(|_| anyhow!("workload worker panicked"))??;
            counts += tally;
        }
        Ok(())
    })?;

    let files: Vec<FileState> = groups.into_iter().flatten().collect();
    counts.lookups += verify_trees(&files)?;
    let pending_blocks_checked = verify_pending(config, &files)?;
    let stats = cache.stats();
    let final_records = verify_stats(&cache, &files, &stats, &counts)?;

    let report = EsWorkloadReport {
        config: config.clone(),
        counts,
        final_records,
        pending_blocks_checked,
        elapsed_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        stats,
    };
    info!(
        target: "ffs::harness",
        event = "es_workload_done",
        files = config.files,
        ops = config.ops,
        threads = config.threads,
        records = report.final_records,
        shrunk = report.stats.shrunk,
        alloc_failures = counts.alloc_failures,
        elapsed_us = report.elapsed_us
    );
    Ok(report)
}

#[expect(clippy::cast_possible_truncation)]
fn drive_worker(
    config: &EsWorkloadConfig,
    worker: u64,
    files: &mut [FileState],
    hub: &PressureHub,
) -> Result<EsOpCounts> {
    let mut rng = WorkloadRng::new(config.seed, worker + 1);
    let mut tally = EsOpCounts::default();
    if files.is_empty() {
        return Ok(tally);
    }
    let total = config.ops.saturating_mul(files.len() as u64);
    let span = config.logical_span;

    for step in 0..total {
        let file = rng.below(files.len() as u32) as usize;
        let state = &mut files[file];
        let lblk = rng.below(span);
        let len = 1 + rng.below(MAX_LEN);

        match rng.below(16) {
            0..=5 => {
                let status = rng.status();
                let pblk = u64::from(rng.next_u32()) * 64;
                tally.inserts += 1;
                match state.tree.insert_extent(lblk, len, pblk, status) {
                    Ok(()) => state.truth.insert(lblk, len, pblk, status),
                    Err(FfsError::NoMemory) => tally.alloc_failures += 1,
                    Err(err) => {
                        return Err(err).with_context(|| format!("insert {lblk}+{len}"));
                    }
                }
            }
            6 | 7 => {
                tally.removes += 1;
                let result = state.tree.remove_extent(lblk, len);
                state.truth.remove(lblk, len);
                match result {
                    Ok(()) => {}
                    Err(FfsError::NoMemory) => {
                        tally.alloc_failures += 1;
                        state.truth.lossy = true;
                    }
                    Err(err) => {
                        return Err(err).with_context(|| format!("remove {lblk}+{len}"));
                    }
                }
            }
            8 => {
                // Only hint holes the block map really has.
                if state.truth.is_vacant(lblk, len) {
                    tally.hints += 1;
                    state.tree.cache_extent(lblk, len, 0, EsStatus::Hole);
                }
            }
            9 => {
                tally.delayed_queries += 1;
                let end = lblk.saturating_add(rng.below(4 * MAX_LEN));
                if let Some(found) = state.tree.find_delayed_extent_range(lblk, end) {
                    tally.delayed_found += 1;
                    ensure!(
                        found.is_delayed() && found.lblk >= lblk && found.end() <= end,
                        "delayed query [{lblk}, {end}] returned {found:?}"
                    );
                }
            }
            _ => {
                tally.lookups += 1;
                if let Some(hit) = state.tree.lookup_extent(lblk) {
                    tally.lookup_hits += 1;
                    check_hit(state, lblk, hit.status, hit.pblock_at(lblk).map(|b| b.0))?;
                }
            }
        }

        if config.pressure_every > 0 && (step + 1) % config.pressure_every == 0 {
            tally.pressure_signals += 1;
            tally.pressure_reclaimed += hub.signal(config.pressure_batch) as u64;
        }
    }
    debug!(
        target: "ffs::harness",
        event = "es_worker_done",
        worker,
        files = files.len(),
        ops = total,
        alloc_failures = tally.alloc_failures
    );
    Ok(tally)
}

fn check_hit(state: &FileState, lblk: u32, status: EsStatus, pblk: Option<u64>) -> Result<()> {
    let (want, want_pblk) = state.truth.at(lblk);
    if status != want {
        bail!(
            "inode {}: block {lblk} cached as {status:?}, block map has {want:?}",
            state.tree.ino().0
        );
    }
    if want.is_mapped() && pblk != Some(want_pblk) {
        bail!(
            "inode {}: block {lblk} maps to {pblk:?}, block map has {want_pblk}",
            state.tree.ino().0
        );
    }
    Ok(())
}

/// Check structure and re-verify one block per record; returns lookups made.
fn verify_trees(files: &[FileState]) -> Result<u64> {
    let mut lookups = 0;
    for state in files {
        state
            .tree
            .check_invariants()
            .with_context(|| format!("tree of inode {}", state.tree.ino().0))?;
        for extent in state.tree.extents() {
            let Some(hit) = state.tree.lookup_extent(extent.lblk) else {
                bail!("record at {} vanished without pressure", extent.lblk);
            };
            lookups += 1;
            if hit.status == EsStatus::Hole {
                let (want, _) = state.truth.at(extent.lblk);
                ensure!(
                    want == EsStatus::Hole,
                    "cached hole at {} hides {want:?}",
                    extent.lblk
                );
            } else {
                check_hit(state, extent.lblk, hit.status, hit.pblock_at(extent.lblk).map(|b| b.0))?;
            }
        }
    }
    Ok(lookups)
}

/// Pending blocks must never be reclaimed. Trees that over-deleted are
/// skipped since their truth may list blocks the cache legitimately lost.
fn verify_pending(config: &EsWorkloadConfig, files: &[FileState]) -> Result<u64> {
    let mut checked = 0;
    for state in files.iter().filter(|s| !s.truth.lossy) {
        let extents = state.tree.extents();
        for (&lblk, &(status, _)) in &state.truth.blocks {
            if status != EsStatus::Delayed && status != EsStatus::Unwritten {
                continue;
            }
            let idx = extents.partition_point(|e| e.end() < lblk);
            let found = extents
                .get(idx)
                .filter(|e| e.contains(lblk))
                .map(|e| e.status);
            ensure!(
                found == Some(status),
                "inode {}: pending block {lblk} ({status:?}) lost, cache has {found:?}",
                state.tree.ino().0
            );
            checked += 1;
        }
    }
    if config.max_records.is_none() {
        ensure!(
            files.iter().all(|s| !s.truth.lossy),
            "an unbounded pool reported NoMemory"
        );
    }
    Ok(checked)
}

fn verify_stats(
    cache: &ExtentStatusCache,
    files: &[FileState],
    stats: &EsStatsSnapshot,
    counts: &EsOpCounts,
) -> Result<u64> {
    let live: usize = files.iter().map(|s| s.tree.len()).sum();
    let reclaimable = files
        .iter()
        .flat_map(|s| s.tree.extents())
        .filter(|e| e.status.is_reclaimable())
        .count();
    ensure!(
        stats.records == live as u64,
        "record counter {} != {live} live records",
        stats.records
    );
    ensure!(
        stats.reclaimable == reclaimable as u64,
        "reclaimable counter {} != {reclaimable}",
        stats.reclaimable
    );
    ensure!(
        cache.records_in_use() == live,
        "allocator holds {} records, trees hold {live}",
        cache.records_in_use()
    );
    ensure!(
        stats.lookups() == counts.lookups,
        "hit+miss counters {} != {} lookups issued",
        stats.lookups(),
        counts.lookups
    );
    if let Some(max) = cache.config().max_records {
        ensure!(live <= max, "{live} live records exceed pool capacity {max}");
    }
    ensure!(
        stats.trees == files.len(),
        "{} trees registered, {} open",
        stats.trees,
        files.len()
    );
    Ok(live as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> EsWorkloadConfig {
        EsWorkloadConfig {
            files: 3,
            ops: 400,
            logical_span: 256,
            pressure_every: 50,
            ..EsWorkloadConfig::default()
        }
    }

    #[test]
    fn rng_is_deterministic_per_stream() {
        let mut a = WorkloadRng::new(7, 1);
        let mut b = WorkloadRng::new(7, 1);
        let mut c = WorkloadRng::new(7, 2);
        let xs: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        let zs: Vec<u32> = (0..8).map(|_| c.next_u32()).collect();
        assert_eq!(xs, ys);
        assert_ne!(xs, zs);
        assert!((0..100).all(|_| a.below(5) < 5));
        assert_eq!(a.below(1), 0);
    }

    #[test]
    fn truth_tracks_blocks() {
        let mut truth = Truth::default();
        truth.insert(10, 4, 100, EsStatus::Written);
        truth.insert(12, 4, 0, EsStatus::Delayed);
        assert_eq!(truth.at(11), (EsStatus::Written, 101));
        assert_eq!(truth.at(13), (EsStatus::Delayed, 0));
        truth.remove(11, 2);
        assert_eq!(truth.at(11), (EsStatus::Hole, 0));
        assert!(truth.is_vacant(11, 2));
        assert!(!truth.is_vacant(10, 2));
    }

    #[test]
    fn rejects_degenerate_config() {
        for config in [
            EsWorkloadConfig { files: 0, ..small() },
            EsWorkloadConfig { threads: 0, ..small() },
            EsWorkloadConfig { logical_span: 0, ..small() },
            EsWorkloadConfig { max_records: Some(0), ..small() },
        ] {
            assert!(run_es_workload(&config).is_err(), "{config:?}");
        }
    }

    #[test]
    fn same_seed_same_counts() {
        let a = run_es_workload(&small()).unwrap();
        let b = run_es_workload(&small()).unwrap();
        assert_eq!(a.counts, b.counts);
        assert_eq!(a.final_records, b.final_records);
        assert_eq!(a.stats.records, b.stats.records);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EsWorkloadConfig = serde_json::from_str(r#"{"files": 2}"#).unwrap();
        assert_eq!(config.files, 2);
        assert_eq!(config.ops, EsWorkloadConfig::default().ops);
    }
}
