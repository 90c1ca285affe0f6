#![forbid(unsafe_code)]
//! Error types for the FrankenFS extent-status cache.
//!
//! # Error Taxonomy
//!
//! | Class | Variant | Surfaced by | errno |
//! |-------|---------|-------------|-------|
//! | allocation failure | `NoMemory` | `insert_extent`, `remove_extent` | `ENOMEM` |
//! | bad arguments | `InvalidExtent` | `insert_extent`, `remove_extent` | `EINVAL` |
//! | broken tree invariant | `InvariantViolation` | any mutation | `EIO` |
//! | shrinker lifecycle | `Registration` | `register_shrinker` | `EBUSY` |
//!
//! "Not found" is not an error: lookups return `Option::None`.
//!
//! `cache_extent` and the reclaim path never return errors; they log and
//! absorb whatever the table above would have reported.
//!
//! ## Invariant violations
//!
//! Mutations are planned, validated and only then applied. A validation
//! failure is reported as `InvariantViolation` and the tree is left exactly
//! as it was before the call. It always indicates a logic defect, never a
//! resource condition, so callers should not retry it.

use thiserror::Error;

/// Unified error type for extent-status cache operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// A new extent-status record could not be allocated.
    ///
    /// Transient: the record pool was exhausted even after a reclaim retry.
    #[error("cannot allocate extent status record")]
    NoMemory,

    /// Caller passed an extent the cache cannot represent.
    #[error("invalid extent at lblk {lblk} (len {len}): {reason}")]
    InvalidExtent {
        lblk: u32,
        len: u32,
        reason: &'static str,
    },

    /// A planned merge or split would corrupt the tree.
    #[error("extent status tree invariant violated at lblk {lblk}: {detail}")]
    InvariantViolation { lblk: u32, detail: String },

    /// The shrinker could not be registered with the memory-pressure host.
    #[error("shrinker registration failed: {0}")]
    Registration(String),
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive. Adding a variant without updating this
    /// function is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NoMemory => libc::ENOMEM,
            Self::InvalidExtent { .. } => libc::EINVAL,
            Self::InvariantViolation { .. } => libc::EIO,
            Self::Registration(_) => libc::EBUSY,
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoMemory)
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FfsError, libc::c_int)> = vec![
            (FfsError::NoMemory, libc::ENOMEM),
            (
                FfsError::InvalidExtent {
                    lblk: 0,
                    len: 0,
                    reason: "zero length",
                },
                libc::EINVAL,
            ),
            (
                FfsError::InvariantViolation {
                    lblk: 7,
                    detail: "overlap".into(),
                },
                libc::EIO,
            ),
            (FfsError::Registration("test".into()), libc::EBUSY),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn only_allocation_failure_is_transient() {
        assert!(FfsError::NoMemory.is_transient());
        assert!(!FfsError::Registration("dup".into()).is_transient());
        assert!(
            !FfsError::InvariantViolation {
                lblk: 0,
                detail: String::new(),
            }
            .is_transient()
        );
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            FfsError::NoMemory.to_string(),
            "cannot allocate extent status record"
        );

        let invalid = FfsError::InvalidExtent {
            lblk: 10,
            len: 0,
            reason: "zero length",
        };
        assert_eq!(
            invalid.to_string(),
            "invalid extent at lblk 10 (len 0): zero length"
        );

        let broken = FfsError::InvariantViolation {
            lblk: 42,
            detail: "records [40, 45] and [44, 50] overlap".into(),
        };
        assert!(broken.to_string().starts_with("extent status tree invariant violated at lblk 42"));

        let reg = FfsError::Registration("already registered".into());
        assert_eq!(
            reg.to_string(),
            "shrinker registration failed: already registered"
        );
    }
}
