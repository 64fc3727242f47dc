//! Slab sizing and formatting.
//!
//! A slab is one contiguous region obtained from the OS, the unit of heap
//! growth. Slabs are never returned and never linked to each other; once
//! formatted, a slab is reachable only through whatever free blocks it
//! contains. A fresh slab holds exactly one free block, bracketed by a
//! fencepost at each end:
//!
//! ```text
//! base                                                   base + SLAB_SIZE
//!  |                                                                 |
//!  v                                                                 v
//!  +-----------+--------+--------------------------+--------+-----------+
//!  | fencepost | header |         payload          | footer | fencepost |
//!  +-----------+--------+--------------------------+--------+-----------+
//!               \___________ the central block ____________/
//! ```
//!
//! The fenceposts are footer-shaped records with `status = Allocated` and
//! `size = 0`. They never enter the free list and are never freed, so
//! neighbor inspection from any real block stops at them: a block touching a
//! fencepost has no neighbor on that side, even when another slab happens to
//! be mapped right next door.

use std::ptr::NonNull;

use crate::header::{BlockHeader, BlockStatus, BoundaryTag, BLOCK_HEADER_SIZE, FOOTER_SIZE};

/// Payload capacity a fresh slab offers once its own metadata is paid for.
pub(crate) const SLAB_PAYLOAD: usize = 2 * 1024 * 1024;

/// Bytes requested from the OS per slab: the payload plus one header/footer
/// pair for the central block plus the two fenceposts. Requested exactly, so
/// the heap statistics account for every byte obtained.
pub(crate) const SLAB_SIZE: usize = SLAB_PAYLOAD + BLOCK_HEADER_SIZE + 3 * FOOTER_SIZE;

/// Total size of the single block spanning a fresh slab.
pub(crate) const SLAB_BLOCK_SIZE: usize = SLAB_SIZE - 2 * FOOTER_SIZE;

/// Writes the two fenceposts and the central free block into a raw region
/// and returns the central block's header, ready to be linked into the free
/// list.
///
/// # Safety
///
/// `base` must point to at least `bytes` writable bytes aligned to the
/// allocator grain, and `bytes` must leave room for the fenceposts plus a
/// minimum block.
pub(crate) unsafe fn format_fresh_slab(base: NonNull<u8>, bytes: usize) -> NonNull<BlockHeader> {
    base.cast::<BoundaryTag>().as_ptr().write(BoundaryTag::fencepost());

    let block = BlockHeader::initialize_at(
        NonNull::new_unchecked(base.as_ptr().add(FOOTER_SIZE)),
        bytes - 2 * FOOTER_SIZE,
        BlockStatus::Unallocated,
    );

    base.as_ptr()
        .add(bytes - FOOTER_SIZE)
        .cast::<BoundaryTag>()
        .write(BoundaryTag::fencepost());

    block
}
