#![forbid(unsafe_code)]
//! In-memory extent-status cache.
//!
//! For each open file the cache remembers what is already known about ranges
//! of logical blocks: written, unwritten (preallocated), delayed allocation,
//! or hole, plus the physical address for the mapped statuses. Read, write
//! and writeback paths ask the cache first and only fall back to the on-disk
//! block map on a miss.
//!
//! # Layout
//!
//! | Module | Provides |
//! |--------|----------|
//! | `status` | [`EsStatus`], [`ExtentStatus`], the packed form [`EsPacked`] |
//! | `tree` | [`EsTree`]: ordered, non-overlapping, maximally merged records |
//! | `pool` | [`RecordAllocator`] seam and the bounded/unbounded pools |
//! | `stats` | [`EsStats`] with sharded counters, [`EsStatsSnapshot`] |
//! | `registry` | [`TreeRegistry`]: round-robin rotation of live trees |
//! | `shrinker` | [`Shrinker`] / [`MemoryPressureHost`] seam, [`PressureHub`] |
//! | `cache` | [`ExtentStatusCache`] and the per-file [`InodeEsTree`] |
//!
//! # Locking
//!
//! Each tree sits behind its own `parking_lot::RwLock`. Mutations take it
//! exclusively; lookups take it shared and touch only atomics (referenced
//! flag, MRU slot). The reclaim path only ever `try_write`s a tree and never
//! holds the registry lock while doing so, so it cannot deadlock with a
//! caller holding any tree lock.
//!
//! # Example
//!
//! ```
//! use ffs_extent_status::{EsConfig, EsStatus, ExtentStatusCache};
//! use ffs_types::InodeNumber;
//!
//! let cache = ExtentStatusCache::new(EsConfig::default());
//! let tree = cache.open_tree(InodeNumber(12));
//! tree.insert_extent(0, 10, 5000, EsStatus::Written)?;
//! tree.remove_extent(3, 4)?;
//!
//! let hit = tree.lookup_extent(8).expect("block 8 is cached");
//! assert_eq!(hit.pblock_at(8).map(|b| b.0), Some(5008));
//! assert!(tree.lookup_extent(4).is_none());
//! # Ok::<(), ffs_error::FfsError>(())
//! ```

pub mod cache;
pub mod pool;
pub mod registry;
pub mod shrinker;
pub mod stats;
pub mod status;
pub mod tree;

pub use cache::{EsConfig, ExtentStatusCache, InodeEsTree};
pub use pool::{BoundedRecordPool, RecordAllocator, Reservation, UnboundedRecordPool};
pub use registry::{TreeCell, TreeId, TreeRegistry};
pub use shrinker::{MemoryPressureHost, PressureHub, ShrinkOutcome, Shrinker, ShrinkerId};
pub use stats::{EsStats, EsStatsSnapshot, ShardedCounter};
pub use status::{ES_FLAGS, ES_MASK, ES_PBLK_MAX, ES_SHIFT, EsPacked, EsStatus, ExtentStatus};
pub use tree::{EsTree, ReclaimOutcome, TreeDelta, TreePlan};
