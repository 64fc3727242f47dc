//! The allocation engine: first-fit search, block splitting, slab extension
//! and eager three-way coalescing. Everything in here assumes the caller
//! already holds the allocator mutex (see [`crate::allocator`]).

use std::{fmt, ptr::NonNull};

#[cfg(feature = "log")]
use log::{debug, error};

use crate::{
    freelist::FreeList,
    header::{block_size_for, BlockHeader, BlockStatus, MIN_BLOCK_SIZE},
    platform,
    slab::{self, SLAB_BLOCK_SIZE, SLAB_PAYLOAD, SLAB_SIZE},
    AllocError, AllocResult, Pointer,
};

/// Snapshot of the allocator's bookkeeping: total bytes obtained from the
/// OS, slab count, and how many times each public operation was called.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    /// Sum of all bytes ever requested from the OS. Never shrinks.
    pub heap_size: usize,
    /// Number of slabs obtained so far. Never shrinks.
    pub num_slabs: usize,
    pub malloc_calls: usize,
    pub free_calls: usize,
    pub realloc_calls: usize,
    pub calloc_calls: usize,
}

/// The free-block engine. One instance exists per process, wrapped in a
/// mutex; the type itself is single-threaded and needs `&mut self` for every
/// mutation.
pub(crate) struct Engine {
    free_blocks: FreeList,
    /// Header of the first slab's first block. Origin for the offsets in
    /// [`Self::dump_free_list`].
    pool_start: Pointer<BlockHeader>,
    pub stats: Stats,
    pub verbose: bool,
}

// The engine owns every pointer it holds (they all target slab memory that
// is never unmapped), and the enclosing mutex serialises all access.
unsafe impl Send for Engine {}

impl Engine {
    pub const fn new() -> Self {
        Self {
            free_blocks: FreeList::new(),
            pool_start: None,
            stats: Stats {
                heap_size: 0,
                num_slabs: 0,
                malloc_calls: 0,
                free_calls: 0,
                realloc_calls: 0,
                calloc_calls: 0,
            },
            verbose: true,
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Returns a payload of at least `size` bytes, aligned to the allocator
    /// grain. First fit over the address-ordered free list; when nothing
    /// fits, the heap grows by one slab and the search restarts from the
    /// head so earlier holes still get first consideration.
    pub unsafe fn allocate(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        // A request that cannot fit the single block of a fresh slab would
        // extend the heap forever without ever finding a fit. Checking the
        // raw size also keeps the rounding below overflow-free.
        if size > SLAB_PAYLOAD {
            error!("rejecting {size} byte request: larger than a slab");
            return Err(AllocError::NoMemory);
        }

        let block_size = block_size_for(size);

        loop {
            if let Some(block) = self.find_first_fit(block_size) {
                return Ok(self.place(block, block_size));
            }

            self.extend_heap()?;
        }
    }

    /// First block in address order big enough for `block_size`, if any.
    unsafe fn find_first_fit(&mut self, block_size: usize) -> Pointer<BlockHeader> {
        for block in self.free_blocks.blocks() {
            if block.as_ref().size() >= block_size {
                return Some(block);
            }
        }

        None
    }

    /// Services a fitting candidate and returns the payload address.
    ///
    /// When the candidate is large enough to leave a minimum block behind,
    /// the allocation is carved out of its **high-address end**: the
    /// low-address remainder keeps its size shrunk and its free-list node
    /// untouched, so splitting never relinks anything. Otherwise the whole
    /// candidate is taken and whatever residue it carries stays inside as
    /// internal fragmentation.
    unsafe fn place(&mut self, mut block: NonNull<BlockHeader>, block_size: usize) -> NonNull<u8> {
        let remainder = block.as_ref().size() - block_size;

        if remainder >= MIN_BLOCK_SIZE {
            block.as_mut().tag.size = remainder;
            BlockHeader::sync_footer(block);

            let carved = BlockHeader::initialize_at(
                NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(remainder)),
                block_size,
                BlockStatus::Allocated,
            );

            BlockHeader::payload_address_of(carved)
        } else {
            block.as_mut().tag.status = BlockStatus::Allocated;
            BlockHeader::sync_footer(block);
            self.free_blocks.unlink(block);

            BlockHeader::payload_address_of(block)
        }
    }

    /// Obtains one slab from the OS, formats it and links its block into the
    /// free list. Slabs are never returned; `heap_size` and `num_slabs` only
    /// ever grow.
    unsafe fn extend_heap(&mut self) -> AllocResult {
        let Some(base) = platform::request_memory(SLAB_SIZE) else {
            error!("the OS denied a slab of {SLAB_SIZE} bytes");
            return Err(AllocError::NoMemory);
        };

        self.stats.heap_size += SLAB_SIZE;
        self.stats.num_slabs += 1;

        let block = slab::format_fresh_slab(base, SLAB_SIZE);

        if self.pool_start.is_none() {
            self.pool_start = Some(block);
        }

        self.free_blocks.insert_address_ordered(block);

        debug!(
            "slab {} obtained: {SLAB_SIZE} bytes at {:p}",
            self.stats.num_slabs, base
        );

        Ok(())
    }

    /// Returns a payload's block to the free list, eagerly merging it with
    /// whichever physical neighbors are free. Fenceposts bound the
    /// inspection on both sides, so merging never crosses a slab boundary.
    ///
    /// The four neighbor combinations:
    ///
    /// | prev free | next free | action                                    |
    /// |-----------|-----------|-------------------------------------------|
    /// | no        | no        | insert the block, address ordered         |
    /// | no        | yes       | grow over next, take next's list slot     |
    /// | yes       | no        | prev grows over the block                 |
    /// | yes       | yes       | prev grows over both, next leaves the list|
    pub unsafe fn free(&mut self, payload: NonNull<u8>) {
        let mut header = BlockHeader::from_payload_address(payload);

        debug_assert!(
            header.as_ref().status() == BlockStatus::Allocated,
            "freeing a block that is not allocated"
        );

        header.as_mut().tag.status = BlockStatus::Unallocated;
        BlockHeader::sync_footer(header);

        match (self.free_neighbor_before(header), self.free_neighbor_after(header)) {
            (None, None) => self.free_blocks.insert_address_ordered(header),

            (None, Some(next)) => {
                header.as_mut().tag.size += next.as_ref().size();
                BlockHeader::sync_footer(header);
                self.free_blocks.replace(next, header);
            }

            (Some(mut prev), None) => {
                prev.as_mut().tag.size += header.as_ref().size();
                BlockHeader::sync_footer(prev);
            }

            (Some(mut prev), Some(next)) => {
                self.free_blocks.unlink(next);
                prev.as_mut().tag.size += header.as_ref().size() + next.as_ref().size();
                BlockHeader::sync_footer(prev);
            }
        }
    }

    /// The physically following block, if it exists and is free. A fencepost
    /// after `header` means the slab ends there.
    unsafe fn free_neighbor_after(&self, header: NonNull<BlockHeader>) -> Pointer<BlockHeader> {
        let boundary = BlockHeader::boundary_after(header);
        let tag = boundary.as_ptr().read();

        if tag.is_fencepost() || tag.status != BlockStatus::Unallocated {
            return None;
        }

        Some(boundary.cast())
    }

    /// The physically preceding block, if it exists and is free, reached
    /// through its footer. A fencepost before `header` means it is the
    /// slab's first block.
    unsafe fn free_neighbor_before(&self, header: NonNull<BlockHeader>) -> Pointer<BlockHeader> {
        let footer = BlockHeader::boundary_before(header).as_ptr().read();

        if footer.is_fencepost() || footer.status != BlockStatus::Unallocated {
            return None;
        }

        Some(BlockHeader::block_before(header, footer))
    }

    /// Renders the free list as one line:
    /// `FreeList: [offset:O,size:S]->[offset:O,size:S]->...`
    ///
    /// Offsets are byte distances from the first slab's first block header.
    /// Later slabs can be mapped below the first one, so the distance is
    /// signed. An empty list renders as `FreeList: ` and the newline.
    pub unsafe fn dump_free_list(&mut self, out: &mut dyn fmt::Write) -> fmt::Result {
        let origin = match self.pool_start {
            Some(start) => start.as_ptr() as isize,
            None => 0,
        };

        out.write_str("FreeList: ")?;

        let mut blocks = self.free_blocks.blocks().peekable();
        while let Some(block) = blocks.next() {
            write!(
                out,
                "[offset:{},size:{}]",
                block.as_ptr() as isize - origin,
                block.as_ref().size()
            )?;

            if blocks.peek().is_some() {
                out.write_str("->")?;
            }
        }

        out.write_str("\n")
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;
    use crate::header::{ALIGNMENT, BLOCK_HEADER_SIZE, FOOTER_SIZE};

    impl Engine {
        fn free_len(&self) -> usize {
            self.free_blocks.len()
        }

        unsafe fn total_free_bytes(&mut self) -> usize {
            self.free_blocks.blocks().map(|block| block.as_ref().size()).sum()
        }

        unsafe fn first_slab_block(&self) -> NonNull<BlockHeader> {
            self.pool_start.unwrap()
        }

        /// Asserts the structural invariants that must hold between any two
        /// public operations.
        unsafe fn check_invariants(&mut self) {
            let mut previous: Pointer<BlockHeader> = None;
            let blocks: Vec<_> = self.free_blocks.blocks().collect();

            for block in blocks {
                if let Some(previous) = previous {
                    assert!(previous < block, "free list out of address order");
                }
                previous = Some(block);

                // Header and footer agree on status and size.
                assert_eq!(block.as_ref().status(), BlockStatus::Unallocated);
                let footer = BlockHeader::footer_of(block).as_ptr().read();
                assert_eq!(footer.size, block.as_ref().size());
                assert_eq!(footer.status, BlockStatus::Unallocated);

                // Coalescing is eager, so no physical neighbor may be free.
                assert!(self.free_neighbor_after(block).is_none(), "missed coalesce after");
                assert!(self.free_neighbor_before(block).is_none(), "missed coalesce before");

                let payload = BlockHeader::payload_address_of(block);
                assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);
            }
        }
    }

    /// Payload size that makes `block_size_for` come out at exactly `total`.
    fn request_for_block_size(total: usize) -> usize {
        total - BLOCK_HEADER_SIZE - FOOTER_SIZE
    }

    #[test]
    fn single_allocation_on_a_fresh_engine() {
        let mut engine = Engine::new();

        unsafe {
            let payload = engine.allocate(8).unwrap();

            assert_eq!(engine.stats().num_slabs, 1);
            assert_eq!(engine.stats().heap_size, SLAB_SIZE);

            // The remainder keeps the slab's first position and its node;
            // the allocation was carved from the high end.
            let first = engine.first_slab_block();
            assert_eq!(engine.free_len(), 1);

            let remainder = engine.free_blocks.first().unwrap();
            assert_eq!(remainder, first);
            assert_eq!(remainder.as_ref().size(), SLAB_BLOCK_SIZE - block_size_for(8));

            let expected = first
                .as_ptr()
                .cast::<u8>()
                .add(SLAB_BLOCK_SIZE - block_size_for(8) + BLOCK_HEADER_SIZE);
            assert_eq!(payload.as_ptr(), expected);
            assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);

            engine.check_invariants();
        }
    }

    #[test]
    fn split_then_free_coalesces_back() {
        let mut engine = Engine::new();

        unsafe {
            let before = {
                engine.allocate(8).map(|p| engine.free(p)).unwrap();
                engine.total_free_bytes()
            };

            let payload = engine.allocate(64).unwrap();
            engine.free(payload);

            assert_eq!(engine.free_len(), 1);
            assert_eq!(engine.total_free_bytes(), before);
            assert_eq!(engine.total_free_bytes(), SLAB_BLOCK_SIZE);
            engine.check_invariants();
        }
    }

    #[test]
    fn three_blocks_coalesce_one_at_a_time() {
        let mut engine = Engine::new();

        unsafe {
            // Carving happens from the high end, so `right` sits against the
            // end fencepost, `middle` under it, and `left` takes the rest of
            // the slab with an exact fit. Physical order: left, middle,
            // right.
            let right = engine.allocate(8).unwrap();
            let middle = engine.allocate(8).unwrap();
            let left = engine
                .allocate(request_for_block_size(SLAB_BLOCK_SIZE - 2 * block_size_for(8)))
                .unwrap();

            assert_eq!(engine.free_len(), 0);
            assert_eq!(engine.stats().num_slabs, 1);

            engine.free(middle);
            assert_eq!(engine.free_len(), 1);
            engine.check_invariants();

            // Left merges with the freed middle: still one block, larger.
            engine.free(left);
            assert_eq!(engine.free_len(), 1);
            assert_eq!(
                engine.total_free_bytes(),
                SLAB_BLOCK_SIZE - block_size_for(8)
            );
            engine.check_invariants();

            // Right closes the gap: back to the original single slab block.
            engine.free(right);
            assert_eq!(engine.free_len(), 1);
            assert_eq!(engine.total_free_bytes(), SLAB_BLOCK_SIZE);
            engine.check_invariants();
        }
    }

    #[test]
    fn exhaustion_obtains_a_second_slab() {
        let mut engine = Engine::new();

        unsafe {
            // Exact fit for the whole slab block empties the list.
            let big = engine.allocate(SLAB_PAYLOAD).unwrap();
            assert_eq!(engine.free_len(), 0);
            assert_eq!(engine.stats().num_slabs, 1);

            let small = engine.allocate(8).unwrap();
            assert_eq!(engine.stats().num_slabs, 2);
            assert_eq!(engine.stats().heap_size, 2 * SLAB_SIZE);
            assert_eq!(engine.free_len(), 1);

            engine.free(small);
            engine.free(big);

            // Slabs never merge with each other: one block per slab.
            assert_eq!(engine.free_len(), 2);
            assert_eq!(engine.total_free_bytes(), 2 * SLAB_BLOCK_SIZE);
            engine.check_invariants();
        }
    }

    #[test]
    fn exact_fit_consumes_the_whole_block() {
        let mut engine = Engine::new();

        unsafe {
            let payload = engine.allocate(SLAB_PAYLOAD).unwrap();
            let header = BlockHeader::from_payload_address(payload);

            assert_eq!(engine.free_len(), 0);
            assert_eq!(header.as_ref().size(), SLAB_BLOCK_SIZE);
            assert_eq!(header.as_ref().payload_size(), SLAB_PAYLOAD);
        }
    }

    #[test]
    fn residue_below_minimum_is_not_split_off() {
        let mut engine = Engine::new();

        unsafe {
            // Start from a single full-slab free block.
            let warmup = engine.allocate(SLAB_PAYLOAD).unwrap();
            engine.free(warmup);
            assert_eq!(engine.free_len(), 1);

            // Leaves a residue of exactly header + footer, which is below
            // the minimum block, so the block must be taken whole.
            let requested = SLAB_PAYLOAD - BLOCK_HEADER_SIZE - FOOTER_SIZE;
            let payload = engine.allocate(requested).unwrap();

            assert_eq!(engine.free_len(), 0);

            let header = BlockHeader::from_payload_address(payload);
            assert_eq!(header.as_ref().size(), SLAB_BLOCK_SIZE);

            // Payload size law: over-provisioning stays bounded.
            let granted = header.as_ref().payload_size();
            assert!(granted >= requested);
            assert!(granted - requested < BLOCK_HEADER_SIZE + FOOTER_SIZE + ALIGNMENT + 8);
        }
    }

    #[test]
    fn first_fit_takes_the_lowest_hole() {
        let mut engine = Engine::new();

        unsafe {
            let high = engine.allocate(1024).unwrap();
            let middle = engine.allocate(1024).unwrap();
            let low = engine.allocate(1024).unwrap();

            // Two holes: the big remainder absorbs `low` at the bottom of
            // the slab, `high` opens a second hole at the top.
            engine.free(low);
            engine.free(high);
            assert_eq!(engine.free_len(), 2);
            engine.check_invariants();

            // First fit walks in ascending address order, so the new
            // payload must come from the bottom hole, below `middle`.
            let payload = engine.allocate(512).unwrap();
            let middle_header = BlockHeader::from_payload_address(middle);
            assert!(payload.as_ptr() < middle_header.as_ptr().cast());

            engine.check_invariants();
        }
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let mut engine = Engine::new();

        unsafe {
            assert_eq!(engine.allocate(SLAB_PAYLOAD + 1), Err(AllocError::NoMemory));
            assert_eq!(engine.allocate(usize::MAX), Err(AllocError::NoMemory));

            // Nothing was obtained on the failed path.
            assert_eq!(engine.stats().num_slabs, 0);
            assert_eq!(engine.stats().heap_size, 0);

            // The engine still works afterwards.
            assert!(engine.allocate(SLAB_PAYLOAD).is_ok());
        }
    }

    #[test]
    fn slab_accounting_adds_up() {
        let mut engine = Engine::new();

        unsafe {
            let a = engine.allocate(100).unwrap();
            let b = engine.allocate(2000).unwrap();
            let c = engine.allocate(30).unwrap();
            engine.free(b);

            // Walk the whole slab physically: every byte between the two
            // fenceposts belongs to exactly one block.
            let mut cursor = engine.first_slab_block();
            let mut total = 0;

            loop {
                total += cursor.as_ref().size();
                let after = BlockHeader::boundary_after(cursor);
                if after.as_ptr().read().is_fencepost() {
                    break;
                }
                cursor = after.cast();
            }

            assert_eq!(total, SLAB_BLOCK_SIZE);

            engine.free(a);
            engine.free(c);
        }
    }

    #[test]
    fn dump_renders_offsets_and_sizes() {
        let mut engine = Engine::new();
        let mut out = String::new();

        unsafe {
            engine.dump_free_list(&mut out).unwrap();
            assert_eq!(out, "FreeList: \n");

            let payload = engine.allocate(8).unwrap();
            out.clear();
            engine.dump_free_list(&mut out).unwrap();
            assert_eq!(
                out,
                format!(
                    "FreeList: [offset:0,size:{}]\n",
                    SLAB_BLOCK_SIZE - block_size_for(8)
                )
            );

            engine.free(payload);
            out.clear();
            engine.dump_free_list(&mut out).unwrap();
            assert_eq!(out, format!("FreeList: [offset:0,size:{SLAB_BLOCK_SIZE}]\n"));
        }
    }

    #[test]
    fn mixed_workload_preserves_invariants() {
        let mut engine = Engine::new();
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        let mut rng: u64 = 0x9E3779B97F4A7C15;

        unsafe {
            for round in 0..400 {
                rng = rng
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);

                if live.len() < 8 || rng % 100 < 55 {
                    let size = ((rng >> 33) % 8192 + 1) as usize;
                    let payload = engine.allocate(size).unwrap();
                    let fill = (rng >> 17) as u8;

                    ptr::write_bytes(payload.as_ptr(), fill, size);
                    live.push((payload, size, fill));
                } else {
                    let index = (rng >> 33) as usize % live.len();
                    let (payload, size, fill) = live.swap_remove(index);

                    // Nothing may have scribbled over this payload.
                    for i in 0..size {
                        assert_eq!(*payload.as_ptr().add(i), fill);
                    }

                    engine.free(payload);
                }

                if round % 16 == 0 {
                    engine.check_invariants();
                }
            }

            for (payload, size, fill) in live.drain(..) {
                for i in 0..size {
                    assert_eq!(*payload.as_ptr().add(i), fill);
                }
                engine.free(payload);
            }

            // Round trip: with everything freed, each slab has collapsed
            // back into its original single block.
            engine.check_invariants();
            assert_eq!(engine.free_len(), engine.stats().num_slabs);
            assert_eq!(
                engine.total_free_bytes(),
                engine.stats().num_slabs * SLAB_BLOCK_SIZE
            );
        }
    }
}
