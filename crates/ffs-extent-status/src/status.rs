//! Extent-status records and their compact 64-bit encoding.
//!
//! [`ExtentStatus`] is the value handed to callers. The tree keeps its own
//! node type with an atomic referenced flag; see `tree.rs`.
//!
//! [`EsPacked`] is the on-disk-width form where the status and referenced
//! bits live in the top [`ES_FLAGS`] bits of the physical block field. The
//! tree never stores it; it exists for consumers that need the compact form.

use ffs_types::{BlockNumber, EXT_MAX_BLOCKS, LogicalRange};
use serde::{Deserialize, Serialize};

// ── Flag layout ─────────────────────────────────────────────────────────────

const ES_WRITTEN_B: u32 = 0;
const ES_UNWRITTEN_B: u32 = 1;
const ES_DELAYED_B: u32 = 2;
const ES_HOLE_B: u32 = 3;
const ES_REFERENCED_B: u32 = 4;

/// Number of flag bits reserved at the top of the packed physical field.
pub const ES_FLAGS: u32 = 5;

/// Bit position of the lowest flag bit.
pub const ES_SHIFT: u32 = u64::BITS - ES_FLAGS;

/// Mask of all flag bits.
pub const ES_MASK: u64 = !0_u64 << ES_SHIFT;

/// Largest physical block address a record can carry.
pub const ES_PBLK_MAX: u64 = !ES_MASK;

const ES_TYPE_MASK: u64 = ((1_u64 << ES_WRITTEN_B)
    | (1_u64 << ES_UNWRITTEN_B)
    | (1_u64 << ES_DELAYED_B)
    | (1_u64 << ES_HOLE_B))
    << ES_SHIFT;

const ES_REFERENCED: u64 = (1_u64 << ES_REFERENCED_B) << ES_SHIFT;

// ── Status ──────────────────────────────────────────────────────────────────

/// Mapping state of a run of logical blocks. Exactly one per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EsStatus {
    /// Allocated and holding data on disk.
    Written,
    /// Allocated (preallocated) but not yet holding caller data.
    Unwritten,
    /// Dirty data with no physical block assigned yet.
    Delayed,
    /// No backing block; reads as zeroes.
    Hole,
}

impl EsStatus {
    pub const ALL: [Self; 4] = [Self::Written, Self::Unwritten, Self::Delayed, Self::Hole];

    /// Statuses that carry a meaningful physical address.
    #[must_use]
    pub const fn is_mapped(self) -> bool {
        matches!(self, Self::Written | Self::Unwritten)
    }

    /// Statuses the reclaim path may evict.
    ///
    /// Written and Hole are recomputable from on-disk metadata. Delayed and
    /// Unwritten records are the only trace of a pending obligation.
    #[must_use]
    pub const fn is_reclaimable(self) -> bool {
        matches!(self, Self::Written | Self::Hole)
    }

    const fn type_bits(self) -> u64 {
        let bit = match self {
            Self::Written => ES_WRITTEN_B,
            Self::Unwritten => ES_UNWRITTEN_B,
            Self::Delayed => ES_DELAYED_B,
            Self::Hole => ES_HOLE_B,
        };
        (1_u64 << bit) << ES_SHIFT
    }

    const fn from_type_bits(bits: u64) -> Option<Self> {
        match (bits & ES_TYPE_MASK) >> ES_SHIFT {
            0b0001 => Some(Self::Written),
            0b0010 => Some(Self::Unwritten),
            0b0100 => Some(Self::Delayed),
            0b1000 => Some(Self::Hole),
            _ => None,
        }
    }
}

// ── Record ──────────────────────────────────────────────────────────────────

/// A cached logical-range-to-status mapping.
///
/// `pblk` is only meaningful for [`EsStatus::is_mapped`] statuses; the
/// constructor normalises it to `0` for Delayed and Hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentStatus {
    pub lblk: u32,
    pub len: u32,
    pub pblk: u64,
    pub status: EsStatus,
    pub referenced: bool,
}

impl ExtentStatus {
    #[must_use]
    pub fn new(lblk: u32, len: u32, pblk: u64, status: EsStatus) -> Self {
        Self {
            lblk,
            len,
            pblk: if status.is_mapped() { pblk } else { 0 },
            status,
            referenced: false,
        }
    }

    /// Last logical block covered (inclusive). Requires `len > 0`.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.lblk.saturating_add(self.len.saturating_sub(1))
    }

    /// The covered range, or `None` if the record is empty or overflows.
    #[must_use]
    pub fn range(&self) -> Option<LogicalRange> {
        LogicalRange::from_len(self.lblk, self.len)
    }

    #[must_use]
    pub fn contains(&self, lblk: u32) -> bool {
        self.len > 0 && self.lblk <= lblk && lblk <= self.end()
    }

    #[must_use]
    pub fn is_written(&self) -> bool {
        self.status == EsStatus::Written
    }

    #[must_use]
    pub fn is_unwritten(&self) -> bool {
        self.status == EsStatus::Unwritten
    }

    #[must_use]
    pub fn is_delayed(&self) -> bool {
        self.status == EsStatus::Delayed
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.status == EsStatus::Hole
    }

    /// Physical block backing `lblk`, for mapped records containing it.
    #[must_use]
    pub fn pblock_at(&self, lblk: u32) -> Option<BlockNumber> {
        if !self.status.is_mapped() || !self.contains(lblk) {
            return None;
        }
        BlockNumber(self.pblk).checked_add(u64::from(lblk - self.lblk))
    }

    /// Physical address `offset` blocks into this record (`0` when unmapped).
    #[must_use]
    pub(crate) fn pblk_offset(&self, offset: u32) -> u64 {
        if self.status.is_mapped() {
            self.pblk + u64::from(offset)
        } else {
            0
        }
    }

    /// Whether `next` can be folded into `self` as one record.
    ///
    /// Requires `next` to start right after `self`, identical status, a
    /// combined length that still fits, and contiguous physical ranges for
    /// mapped statuses. The referenced flag is ignored.
    #[must_use]
    pub fn can_merge(&self, next: &Self) -> bool {
        if self.status != next.status {
            return false;
        }
        if self.len == 0 || next.len == 0 {
            return false;
        }
        if self.end().checked_add(1) != Some(next.lblk) {
            return false;
        }
        if u64::from(self.len) + u64::from(next.len) > u64::from(EXT_MAX_BLOCKS) {
            return false;
        }
        if self.status.is_mapped() {
            return self.pblk.checked_add(u64::from(self.len)) == Some(next.pblk);
        }
        true
    }

    /// Fold `next` into `self`. Caller must have checked [`Self::can_merge`].
    pub(crate) fn absorb(&mut self, next: &Self) {
        self.len += next.len;
    }

    /// Clip the record to `window`, adjusting the physical address.
    #[must_use]
    pub fn clipped(&self, window: LogicalRange) -> Option<Self> {
        let clipped = self.range()?.intersect(window)?;
        let offset = clipped.start() - self.lblk;
        let len = u32::try_from(clipped.len_u64()).ok()?;
        Some(Self {
            lblk: clipped.start(),
            len,
            pblk: self.pblk_offset(offset),
            status: self.status,
            referenced: self.referenced,
        })
    }

    /// Encode into the compact 64-bit physical field.
    #[must_use]
    pub fn to_packed(&self) -> EsPacked {
        let mut packed = EsPacked::new(self.pblk, self.status);
        if self.referenced {
            packed.set_referenced();
        }
        packed
    }

    /// Rebuild a record from its logical coordinates and packed field.
    ///
    /// Returns `None` when the packed field carries no (or more than one)
    /// status bit.
    #[must_use]
    pub fn from_packed(lblk: u32, len: u32, packed: EsPacked) -> Option<Self> {
        let status = packed.status()?;
        let mut es = Self::new(lblk, len, packed.pblock(), status);
        es.referenced = packed.is_referenced();
        Some(es)
    }
}

// ── Packed form ─────────────────────────────────────────────────────────────

/// Physical block address with status and referenced bits in the high bits.
///
/// Every accessor reads or writes only its own bits; setting one field never
/// disturbs the others. Addresses wider than [`ES_PBLK_MAX`] are truncated to
/// the address bits, never allowed to spill into the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EsPacked(u64);

impl EsPacked {
    #[must_use]
    pub fn new(pblk: u64, status: EsStatus) -> Self {
        let mut packed = Self(0);
        packed.store_pblock_status(pblk, status);
        packed
    }

    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn pblock(self) -> u64 {
        self.0 & !ES_MASK
    }

    pub fn store_pblock(&mut self, pblk: u64) {
        self.0 = (pblk & !ES_MASK) | (self.0 & ES_MASK);
    }

    /// The single status tag, if exactly one is set.
    #[must_use]
    pub fn status(self) -> Option<EsStatus> {
        EsStatus::from_type_bits(self.0)
    }

    /// Replace the status tag, keeping the address and referenced bit.
    pub fn store_status(&mut self, status: EsStatus) {
        self.0 = (self.0 & !ES_TYPE_MASK) | status.type_bits();
    }

    /// Replace address and status together. Clears the referenced bit.
    pub fn store_pblock_status(&mut self, pblk: u64, status: EsStatus) {
        self.0 = status.type_bits() | (pblk & !ES_MASK);
    }

    #[must_use]
    pub fn is_referenced(self) -> bool {
        self.0 & ES_REFERENCED != 0
    }

    pub fn set_referenced(&mut self) {
        self.0 |= ES_REFERENCED;
    }

    pub fn clear_referenced(&mut self) {
        self.0 &= !ES_REFERENCED;
    }
}
