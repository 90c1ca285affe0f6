#![forbid(unsafe_code)]
//! Shared primitive types for the FrankenFS extent-status cache.
//!
//! Logical blocks follow the ext4 `ext4_lblk_t` width (32 bits); physical
//! blocks use the full `ext4_fsblk_t` width (64 bits).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest logical block number addressable by an extent (ext4 `EXT_MAX_BLOCKS`).
///
/// Also used as the open end of "to end of file" ranges.
pub const EXT_MAX_BLOCKS: u32 = u32::MAX;

/// Physical block address on the underlying device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Inode number of the file owning an extent-status tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

/// Inclusive range of logical blocks `[start, end]`.
///
/// Invariant: `start <= end`. A range always covers at least one block, so
/// the maximal range `[0, EXT_MAX_BLOCKS]` is representable without a
/// 33-bit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalRange {
    start: u32,
    end: u32,
}

impl LogicalRange {
    /// Build from an inclusive `[start, end]` pair.
    #[must_use]
    pub fn new(start: u32, end: u32) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Build from a start block and a block count.
    ///
    /// Returns `None` for `len == 0` or when the last block would overflow
    /// the logical block space.
    #[must_use]
    pub fn from_len(start: u32, len: u32) -> Option<Self> {
        let last = len.checked_sub(1)?;
        let end = start.checked_add(last)?;
        Some(Self { start, end })
    }

    /// Like [`Self::from_len`], but clamps the end at [`EXT_MAX_BLOCKS`].
    #[must_use]
    pub fn from_len_saturating(start: u32, len: u32) -> Option<Self> {
        let last = len.checked_sub(1)?;
        Some(Self {
            start,
            end: start.saturating_add(last),
        })
    }

    #[must_use]
    pub fn start(self) -> u32 {
        self.start
    }

    #[must_use]
    pub fn end(self) -> u32 {
        self.end
    }

    /// Number of blocks covered, widened so the maximal range fits.
    #[must_use]
    pub fn len_u64(self) -> u64 {
        u64::from(self.end - self.start) + 1
    }

    #[must_use]
    pub fn contains(self, lblk: u32) -> bool {
        self.start <= lblk && lblk <= self.end
    }

    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Intersection of two ranges, if any.
    #[must_use]
    pub fn intersect(self, other: Self) -> Option<Self> {
        Self::new(self.start.max(other.start), self.end.min(other.end))
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_from_len_rejects_empty_and_overflow() {
        assert_eq!(LogicalRange::from_len(10, 0), None);
        assert_eq!(LogicalRange::from_len(u32::MAX, 2), None);

        let r = LogicalRange::from_len(10, 5).expect("range");
        assert_eq!((r.start(), r.end()), (10, 14));
        assert_eq!(r.len_u64(), 5);
    }

    #[test]
    fn range_saturating_clamps_to_max_block() {
        let r = LogicalRange::from_len_saturating(100, u32::MAX).expect("range");
        assert_eq!(r.end(), EXT_MAX_BLOCKS);
        assert_eq!(LogicalRange::from_len_saturating(100, 0), None);
    }

    #[test]
    fn maximal_range_length_fits() {
        let r = LogicalRange::new(0, EXT_MAX_BLOCKS).expect("range");
        assert_eq!(r.len_u64(), 1_u64 << 32);
    }

    #[test]
    fn overlap_and_intersection() {
        let a = LogicalRange::new(0, 9).expect("a");
        let b = LogicalRange::new(5, 20).expect("b");
        let c = LogicalRange::new(10, 12).expect("c");
        assert!(a.overlaps(b));
        assert!(!a.overlaps(c));
        assert_eq!(a.intersect(b), LogicalRange::new(5, 9));
        assert_eq!(a.intersect(c), None);
        assert!(b.contains(20));
        assert!(!b.contains(21));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert_eq!(LogicalRange::new(5, 4), None);
    }

    #[test]
    fn display_formats() {
        assert_eq!(BlockNumber(42).to_string(), "42");
        assert_eq!(InodeNumber(2).to_string(), "2");
        assert_eq!(LogicalRange::new(3, 7).expect("r").to_string(), "[3, 7]");
        assert_eq!(BlockNumber(1).checked_add(u64::MAX), None);
    }
}
