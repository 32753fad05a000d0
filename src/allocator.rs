use std::{cmp, ptr::NonNull};

use log::debug;

use crate::{
    block::{Block, BLOCK_ALIGN, BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE},
    growth::RegionSource,
    region::Region,
    Pointer,
};

/// Size in bytes of the first region increment. The managed region starts
/// out as one free block of exactly this size.
pub(crate) const REGION_INIT_SIZE: usize = 4096;

/// Buddy allocator over one contiguous memory region obtained from a
/// [`RegionSource`]. The region is an unbroken sequence of power of two
/// sized blocks; allocation narrows a free block down to the tightest fit by
/// halving it, deallocation merges freed blocks with their buddies back into
/// bigger ones:
///
/// ```text
///  allocate(x)                                  free(b)
///
///  +---------------+    split     +-------+     +-------+    merge    +---------------+
///  |     free      |   ------->   | used  |     | free  |   ------->  |     free      |
///  +---------------+              +-------+     +-------+             +---------------+
///          2s                         s             s                         2s
/// ```
///
/// The *buddy* of a block is the unique other block of the same size whose
/// combination with it forms the next larger power of two aligned block. It
/// is computed from the block's offset and size alone, never found by
/// searching, which is the whole point of the scheme.
///
/// Every operation needs `&mut self` and the struct is not thread safe. See
/// [`crate::Ruddy`] for the mutex-guarded process wide wrapper.
///
/// # Contract
///
/// Passing [`BuddyAllocator::free`] or [`BuddyAllocator::reallocate`] a
/// pointer that was not returned by this exact allocator, or that was
/// already freed, is undefined behaviour. Nothing validates pointers, that
/// is what makes the fast path fast.
pub struct BuddyAllocator<S: RegionSource> {
    /// Host growth primitive.
    source: S,
    /// Managed region. `None` until the first allocation.
    region: Option<Region>,
}

impl<S: RegionSource> BuddyAllocator<S> {
    /// Creates the allocator. No memory is requested from `source` until the
    /// first call to [`BuddyAllocator::allocate`].
    pub const fn new(source: S) -> Self {
        Self {
            source,
            region: None,
        }
    }

    /// Allocates `size` bytes and returns the address of the first one.
    /// `size == 0` is a valid request and yields the smallest block. Returns
    /// `None` only when the region source cannot grow any further; existing
    /// allocations and the region itself are untouched in that case.
    ///
    /// # Panics
    ///
    /// Panics if the very first region increment cannot be obtained. An
    /// allocator that never had any memory cannot do anything useful and
    /// there is no way to report that through the allocate contract.
    ///
    /// # Safety
    ///
    /// The returned address is valid for `size` bytes (usually more) until
    /// it is passed to [`BuddyAllocator::free`] or
    /// [`BuddyAllocator::reallocate`]. Caller must not touch any byte
    /// outside that range.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        self.initialize();
        let region = self.region.as_mut().unwrap_unchecked();

        // Next-fit scan: walk blocks in address order starting at the
        // cursor, wrapping past the last block, until something free and big
        // enough shows up. Starting where the previous search left off
        // spreads the scans across the region instead of hammering the
        // first blocks.
        let mut block = region.cursor();
        let mut found = None;

        loop {
            if block.as_ref().is_free && block.as_ref().usable_size() >= size {
                found = Some(block);
                break;
            }

            block = region.following(block);

            // Walked the entire region without luck.
            if block == region.cursor() {
                break;
            }
        }

        let mut block = match found {
            Some(block) => block,
            None => Self::grow_region(&mut self.source, region, size)?,
        };

        Self::split_to_fit(block, size);
        block.as_mut().is_free = false;

        let rotated = region.following(block);
        region.set_cursor(rotated);

        Some(Block::payload_address_of(block))
    }

    /// Returns a block to the free state and merges it with its buddy as
    /// many times as possible. Worst case the cascade turns the whole region
    /// back into one free block.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this allocator and not freed
    /// since. Double frees and foreign pointers are undefined behaviour.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        let Some(region) = self.region.as_mut() else {
            return;
        };

        let block = Block::from_payload_address(address);
        let merged = Self::coalesce(region, block);

        // Freshly freed space is the best candidate for the next allocation.
        region.set_cursor(merged);
    }

    /// Grows or shrinks the allocation at `address` to `size` bytes.
    /// `size == 0` frees the allocation and returns `None`. On success the
    /// returned address (which may or may not equal `address`) holds the
    /// first `min(old size, size)` bytes of the old content. On failure
    /// (`None` with `size > 0`) the original allocation is fully intact,
    /// address, content and all.
    ///
    /// # Safety
    ///
    /// Same contract as [`BuddyAllocator::free`] for `address`. After a
    /// successful call that returns a different address, the old one must
    /// not be used again.
    pub unsafe fn reallocate(&mut self, address: NonNull<u8>, size: usize) -> Pointer<u8> {
        if size == 0 {
            self.free(address);
            return None;
        }

        let Some(region) = self.region.as_mut() else {
            return None;
        };

        let block = Block::from_payload_address(address);

        // Shrinking (or a no-op): the block already holds enough bytes.
        // Split off the excess so it becomes reusable, nothing moves.
        if block.as_ref().usable_size() >= size {
            Self::split_to_fit(block, size);
            let rotated = region.following(block);
            region.set_cursor(rotated);
            return Some(address);
        }

        // Growing. First try to absorb free buddies sitting directly to the
        // right, which enlarges the block without moving a single byte of
        // content.
        if Self::grow_in_place(region, block, size) {
            return Some(address);
        }

        // No luck, the content has to move: free the block (letting it
        // coalesce), allocate a fresh one and copy the payload over.
        let old_block_size = block.as_ref().size;
        let old_usable = block.as_ref().usable_size();
        let merged = Self::coalesce(region, block);
        region.set_cursor(merged);

        match self.allocate(size) {
            Some(new_address) => {
                // The new block may well overlap the old content, for
                // example when the freed block merged into the block that
                // ends up being returned. `ptr::copy` has memmove semantics
                // so overlapping ranges are fine in either direction.
                let count = cmp::min(old_usable, size);
                std::ptr::copy(address.as_ptr(), new_address.as_ptr(), count);
                Some(new_address)
            }
            None => {
                // Roll back: the merged free block still contains the old
                // block untouched, so carve the exact original block out of
                // it again and mark it used. The caller keeps its pointer
                // and its data.
                Self::restore(merged, block, old_block_size);
                None
            }
        }
    }

    /// Establishes the region on first use: one free block of
    /// [`REGION_INIT_SIZE`] bytes starting at the host's current end,
    /// rounded up to header alignment.
    unsafe fn initialize(&mut self) {
        if self.region.is_some() {
            return;
        }

        const FAILURE: &str = "ruddy: the region source failed to provide the initial region";

        let raw = self.source.current_end().expect(FAILURE);

        // The host end may not be aligned for block headers. Request the
        // round-up slack as part of the first increment and discard it.
        let address = raw.as_ptr() as usize;
        let padding = (BLOCK_ALIGN - address % BLOCK_ALIGN) % BLOCK_ALIGN;

        self.source
            .grow(padding + REGION_INIT_SIZE)
            .expect(FAILURE);

        let start = NonNull::new_unchecked(raw.as_ptr().add(padding));
        self.region = Some(Region::new(start, REGION_INIT_SIZE));

        debug!("initialized region: {REGION_INIT_SIZE} bytes at {start:?}");
    }

    /// Growth policy, invoked only when the scan saw every block and found
    /// no fit. Returns the block that will satisfy the pending allocation of
    /// `size` usable bytes, or `None` if the source is exhausted. Increments
    /// already granted when a later step fails are kept: they are valid free
    /// blocks, just not big enough.
    unsafe fn grow_region(source: &mut S, region: &mut Region, size: usize) -> Pointer<Block> {
        let required = size.checked_add(BLOCK_HEADER_SIZE)?;

        // A region that is still one big free block grows in place. Double
        // the block until it holds the request, with a single host call for
        // the whole increment. This keeps early growth bursts from chopping
        // the first block into pieces that can never merge back while the
        // caller holds none of them.
        if let Some(mut block) = region.single_spanning_free_block() {
            let mut new_size = region.total_size();
            while new_size < required {
                new_size = new_size.checked_mul(2)?;
            }

            let increment = new_size - region.total_size();
            source.grow(increment)?;
            region.extend(increment);
            block.as_mut().size = new_size;

            debug!("grew the spanning free block in place to {new_size} bytes");

            return Some(block);
        }

        // General case: append one free block sized like the whole current
        // region, doubling the region per step, until the appended block
        // alone can hold the request.
        loop {
            let increment = region.total_size();
            source.grow(increment)?;
            let block = region.append_block(increment);

            debug!(
                "appended a {increment} byte free block, region is now {} bytes",
                region.total_size()
            );

            if block.as_ref().size >= required {
                return Some(block);
            }
        }
    }

    /// Best fit under the buddy constraint: repeatedly halves `block` while
    /// a half would still hold `size` usable bytes, handing the upper half
    /// back as a new free block each time.
    ///
    /// ```text
    /// +-------------------------------+      +---------------+---------------+
    /// | Block                         |  ->  | Block         | free          |
    /// +-------------------------------+      +---------------+---------------+
    ///                2s                              s               s
    /// ```
    unsafe fn split_to_fit(mut block: NonNull<Block>, size: usize) {
        while block.as_ref().half_usable_size() >= size && block.as_ref().size / 2 >= MIN_BLOCK_SIZE
        {
            let half = block.as_ref().size / 2;
            block.as_mut().size = half;

            let upper = Block::neighbor_of(block);
            *upper.as_ptr() = Block {
                size: half,
                is_free: true,
            };
        }
    }

    /// Marks `block` free and merges it with its buddy transitively. Returns
    /// the final (possibly merged, possibly relocated to a lower address)
    /// free block.
    ///
    /// A block whose offset is a multiple of twice its size sits in the
    /// lower half of its double sized slot, so its buddy is the block right
    /// after it; otherwise the buddy is right before it. Merging keeps the
    /// lower address and doubles the size:
    ///
    /// ```text
    /// +-----------+-----------+        +-----------------------+
    /// | freed     | buddy     |   ->   | free                  |
    /// +-----------+-----------+        +-----------------------+
    ///       s           s                         2s
    /// ```
    ///
    /// The merge is refused unless the buddy is a real block (not past the
    /// region end), has exactly the same size and is free. The alignment
    /// invariant guarantees that the computed buddy address always lands on
    /// a valid header: no block ever straddles a boundary that is a multiple
    /// of its own size.
    unsafe fn coalesce(region: &mut Region, mut block: NonNull<Block>) -> NonNull<Block> {
        block.as_mut().is_free = true;

        loop {
            let size = block.as_ref().size;
            let offset = region.offset_of(block);

            let (buddy, mut merged) = if offset % (2 * size) == 0 {
                (Block::neighbor_of(block), block)
            } else {
                let address = block.as_ptr().cast::<u8>().sub(size);
                let buddy = NonNull::new_unchecked(address.cast::<Block>());
                (buddy, buddy)
            };

            if buddy.cast::<u8>() == region.end_address()
                || buddy.as_ref().size != size
                || !buddy.as_ref().is_free
            {
                return block;
            }

            merged.as_mut().size = 2 * size;
            merged.as_mut().is_free = true;

            block = merged;
        }
    }

    /// In place growth for [`BuddyAllocator::reallocate`]: absorbs the free
    /// buddy to the right repeatedly until the block holds `size` usable
    /// bytes, then commits the enlarged size. Only works while the block is
    /// the lower buddy at each level, because only then is the absorbed
    /// space contiguous to the right and no content has to move. Returns
    /// whether it succeeded; on failure nothing was modified.
    unsafe fn grow_in_place(region: &mut Region, mut block: NonNull<Block>, size: usize) -> bool {
        let offset = region.offset_of(block);
        let mut new_size = block.as_ref().size;

        while new_size - BLOCK_HEADER_SIZE < size {
            // Must be the lower buddy at the current level.
            if offset % (2 * new_size) != 0 {
                return false;
            }

            let address = block.as_ptr().cast::<u8>().add(new_size);
            if address == region.end_address().as_ptr() {
                return false;
            }

            let buddy = address.cast::<Block>();
            if !(*buddy).is_free || (*buddy).size != new_size {
                return false;
            }

            new_size = match new_size.checked_mul(2) {
                Some(doubled) => doubled,
                None => return false,
            };
        }

        block.as_mut().size = new_size;

        // The cursor may have pointed at one of the absorbed headers.
        let cursor = region.cursor().as_ptr() as usize;
        let start = block.as_ptr() as usize;
        if cursor > start && cursor < start + new_size {
            let rotated = region.following(block);
            region.set_cursor(rotated);
        }

        true
    }

    /// Rollback half of the reallocate move path. `container` is the free
    /// block that swallowed the original block when it was freed; split it
    /// back down until a block of `target_size` exists at the original
    /// address `target` again, then mark it used.
    ///
    /// Every header written here lands on a power of two boundary at least
    /// as coarse as the original block's size, and the original block never
    /// straddled such a boundary, so the original content is not touched.
    unsafe fn restore(mut container: NonNull<Block>, target: NonNull<Block>, target_size: usize) {
        while container.as_ref().size > target_size {
            let half = container.as_ref().size / 2;
            container.as_mut().size = half;

            let upper = Block::neighbor_of(container);
            *upper.as_ptr() = Block {
                size: half,
                is_free: true,
            };

            if target.as_ptr() as usize >= upper.as_ptr() as usize {
                container = upper;
            }
        }

        debug_assert_eq!(container, target);
        container.as_mut().is_free = false;
    }
}
