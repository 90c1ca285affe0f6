//! Rotation of live trees for one filesystem instance.
//!
//! Trees are keyed by a monotonic [`TreeId`] handed out at open time, so key
//! order is registration order. The reclaim path walks that order starting
//! after the tree it visited last, which spreads eviction cost across files.

use crate::tree::EsTree;
use ffs_types::InodeNumber;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Registration-order identity of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId(pub u64);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "es-tree#{}", self.0)
    }
}

/// A tree plus the per-file state the reclaim path needs.
#[derive(Debug)]
pub struct TreeCell {
    id: TreeId,
    ino: InodeNumber,
    pub(crate) tree: RwLock<EsTree>,
    precached: AtomicBool,
}

impl TreeCell {
    #[must_use]
    pub fn id(&self) -> TreeId {
        self.id
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn is_precached(&self) -> bool {
        self.precached.load(Ordering::Relaxed)
    }

    pub(crate) fn set_precached(&self, precached: bool) {
        self.precached.store(precached, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    trees: BTreeMap<TreeId, Arc<TreeCell>>,
    next_id: u64,
    cursor: Option<TreeId>,
}

/// Registry of live trees. Owned by the cache, never global.
#[derive(Debug, Default)]
pub struct TreeRegistry {
    inner: Mutex<RegistryInner>,
}

impl TreeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and list an empty tree for `ino`.
    pub fn open(&self, ino: InodeNumber) -> Arc<TreeCell> {
        let mut inner = self.inner.lock();
        let id = TreeId(inner.next_id);
        inner.next_id += 1;
        let cell = Arc::new(TreeCell {
            id,
            ino,
            tree: RwLock::new(EsTree::new()),
            precached: AtomicBool::new(false),
        });
        inner.trees.insert(id, Arc::clone(&cell));
        cell
    }

    /// Delist a tree. Returns whether it was listed.
    pub fn close(&self, id: TreeId) -> bool {
        let mut inner = self.inner.lock();
        if inner.cursor == Some(id) {
            // Keep the rotation position: the next tree in order follows.
            inner.cursor = inner.trees.range(..id).next_back().map(|(k, _)| *k);
        }
        inner.trees.remove(&id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().trees.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live trees, starting after the last visited one and wrapping.
    ///
    /// The registry lock is released before returning; callers lock trees
    /// from the snapshot.
    #[must_use]
    pub fn rotation(&self) -> Vec<Arc<TreeCell>> {
        let inner = self.inner.lock();
        let Some(cursor) = inner.cursor else {
            return inner.trees.values().cloned().collect();
        };
        let after = inner
            .trees
            .range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded));
        let upto = inner.trees.range(..=cursor);
        after.chain(upto).map(|(_, cell)| Arc::clone(cell)).collect()
    }

    /// Record `id` as the last tree visited.
    pub fn advance(&self, id: TreeId) {
        self.inner.lock().cursor = Some(id);
    }
}
