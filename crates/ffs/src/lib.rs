#![forbid(unsafe_code)]
//! FrankenFS public API facade.
//!
//! Re-exports the extent-status cache and its shared types through a stable
//! external interface. Downstream consumers depend on this crate rather than
//! on the individual workspace members.

pub use ffs_error::{FfsError, Result};
pub use ffs_extent_status::*;
pub use ffs_types::{BlockNumber, EXT_MAX_BLOCKS, InodeNumber, LogicalRange};
