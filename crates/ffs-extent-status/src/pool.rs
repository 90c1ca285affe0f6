//! Record storage accounting.
//!
//! The cache does not own a slab allocator. Every live record is backed by
//! one unit reserved from a [`RecordAllocator`]; exhausting the allocator is
//! how `NoMemory` reaches callers. Tests and the harness use a
//! [`BoundedRecordPool`] to force allocation failures deterministically.

use ffs_error::{FfsError, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of storage for new extent-status records.
pub trait RecordAllocator: Send + Sync + fmt::Debug {
    /// Reserve storage for `n` records. All-or-nothing.
    fn try_reserve(&self, n: usize) -> Result<()>;

    /// Return storage for `n` records.
    fn release(&self, n: usize);

    /// Records currently backed by this allocator.
    fn in_use(&self) -> usize;
}

// ── Bounded pool ────────────────────────────────────────────────────────────

/// Fixed-capacity pool. Reservations beyond `capacity` fail with `NoMemory`.
#[derive(Debug)]
pub struct BoundedRecordPool {
    capacity: usize,
    in_use: AtomicUsize,
}

impl BoundedRecordPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }
}

impl RecordAllocator for BoundedRecordPool {
    fn try_reserve(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(n)
                .filter(|next| *next <= self.capacity)
                .ok_or(FfsError::NoMemory)?;
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let prev = self.in_use.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "released {n} records but only {prev} in use");
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

// ── Unbounded pool ──────────────────────────────────────────────────────────

/// Pool that never fails; only counts.
#[derive(Debug, Default)]
pub struct UnboundedRecordPool {
    in_use: AtomicUsize,
}

impl UnboundedRecordPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordAllocator for UnboundedRecordPool {
    fn try_reserve(&self, n: usize) -> Result<()> {
        self.in_use.fetch_add(n, Ordering::AcqRel);
        Ok(())
    }

    fn release(&self, n: usize) {
        let prev = self.in_use.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "released {n} records but only {prev} in use");
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

// ── Reservation guard ───────────────────────────────────────────────────────

/// Units reserved ahead of a mutation.
///
/// [`Reservation::commit`] hands units over to newly created records. Units
/// still held when the guard drops go back to the allocator, so an aborted
/// or over-estimated mutation never leaks storage.
#[derive(Debug)]
pub struct Reservation {
    alloc: Arc<dyn RecordAllocator>,
    remaining: usize,
}

impl Reservation {
    pub fn new(alloc: &Arc<dyn RecordAllocator>, n: usize) -> Result<Self> {
        alloc.try_reserve(n)?;
        Ok(Self {
            alloc: Arc::clone(alloc),
            remaining: n,
        })
    }

    /// Consume `n` units for records that now exist in a tree.
    pub fn commit(&mut self, n: usize) -> Result<()> {
        if n > self.remaining {
            return Err(FfsError::NoMemory);
        }
        self.remaining -= n;
        Ok(())
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.alloc.release(self.remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded(capacity: usize) -> (Arc<BoundedRecordPool>, Arc<dyn RecordAllocator>) {
        let pool = Arc::new(BoundedRecordPool::new(capacity));
        let dyn_pool: Arc<dyn RecordAllocator> = pool.clone();
        (pool, dyn_pool)
    }

    #[test]
    fn bounded_pool_is_all_or_nothing() {
        let (pool, _) = bounded(3);
        pool.try_reserve(2).expect("fits");
        assert!(matches!(pool.try_reserve(2), Err(FfsError::NoMemory)));
        assert_eq!(pool.in_use(), 2, "failed reserve must not leak");
        pool.try_reserve(1).expect("exact fit");
        pool.release(3);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn zero_reserve_always_succeeds() {
        let (pool, _) = bounded(0);
        pool.try_reserve(0).expect("nothing to reserve");
        assert!(pool.try_reserve(1).is_err());
    }

    #[test]
    fn reservation_returns_uncommitted_units() {
        let (pool, alloc) = bounded(4);
        {
            let mut res = Reservation::new(&alloc, 2).expect("reserve");
            res.commit(1).expect("commit");
            assert_eq!(res.remaining(), 1);
            assert_eq!(pool.in_use(), 2);
        }
        assert_eq!(pool.in_use(), 1, "one committed unit stays in use");
    }

    #[test]
    fn reservation_cannot_overcommit() {
        let (_, alloc) = bounded(4);
        let mut res = Reservation::new(&alloc, 1).expect("reserve");
        assert!(res.commit(2).is_err());
        assert_eq!(res.remaining(), 1);
    }

    #[test]
    fn bounded_pool_under_contention_never_exceeds_capacity() {
        let (pool, _) = bounded(100);
        std::thread::scope(|s| {
            for _ in 0..8 {
                let pool = &pool;
                s.spawn(move || {
                    for _ in 0..50 {
                        let _ = pool.try_reserve(1);
                    }
                });
            }
        });
        assert_eq!(pool.in_use(), 100);
    }

    #[test]
    fn unbounded_pool_counts() {
        let pool = UnboundedRecordPool::new();
        pool.try_reserve(10).expect("never fails");
        pool.release(4);
        assert_eq!(pool.in_use(), 6);
    }
}
