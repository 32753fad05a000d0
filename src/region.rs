use std::ptr::NonNull;

use crate::block::Block;

/// Bounds of the managed region plus the next-fit scan cursor. This is the
/// entire mutable state of the buddy allocator besides the block headers
/// themselves, which live inside the region:
///
/// ```text
/// start                                                      end
///   |                                                         |
///   v                                                         v
///   +-----------+-----------+-----------------+---------------+
///   | Block     | Block     | Block           | Block         |
///   +-----------+-----------+-----------------+---------------+
///               ^
///               |
///             next (where the next allocation scan begins)
/// ```
///
/// `start` never moves once the region exists and `end` only grows, the
/// region is never returned to the host. The cursor is a performance hint,
/// not a correctness requirement: it always points at a valid header but any
/// header would do.
pub(crate) struct Region {
    start: NonNull<Block>,
    end: NonNull<u8>,
    next: NonNull<Block>,
}

impl Region {
    /// Creates the region over `size` bytes starting at `start` and writes
    /// the initial block header, one free block spanning everything.
    ///
    /// # Safety
    ///
    /// `start` must be aligned to [`crate::block::BLOCK_ALIGN`] and point to
    /// at least `size` writable bytes owned by the allocator. `size` must be
    /// a power of two.
    pub unsafe fn new(start: NonNull<u8>, size: usize) -> Self {
        let start = start.cast::<Block>();

        *start.as_ptr() = Block {
            size,
            is_free: true,
        };

        Self {
            start,
            end: NonNull::new_unchecked(start.as_ptr().cast::<u8>().add(size)),
            next: start,
        }
    }

    #[inline]
    pub fn start(&self) -> NonNull<Block> {
        self.start
    }

    /// One past the last block. Never a valid header.
    #[inline]
    pub fn end_address(&self) -> NonNull<u8> {
        self.end
    }

    /// Current scan cursor.
    #[inline]
    pub fn cursor(&self) -> NonNull<Block> {
        self.next
    }

    #[inline]
    pub fn set_cursor(&mut self, block: NonNull<Block>) {
        self.next = block;
    }

    /// Total size of the region in bytes. Equals the sum of all block sizes.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.end.as_ptr() as usize - self.start.as_ptr() as usize
    }

    /// Byte offset of `block` from the start of the region. The buddy math
    /// works on offsets, not absolute addresses.
    #[inline]
    pub fn offset_of(&self, block: NonNull<Block>) -> usize {
        block.as_ptr() as usize - self.start.as_ptr() as usize
    }

    /// Block that follows `block` in address order, wrapping back to the
    /// first block after the last one.
    ///
    /// # Safety
    ///
    /// `block` must be a valid header within this region.
    pub unsafe fn following(&self, block: NonNull<Block>) -> NonNull<Block> {
        let neighbor = Block::neighbor_of(block);

        if neighbor.cast::<u8>() == self.end {
            self.start
        } else {
            neighbor
        }
    }

    /// Returns the first block if it is free and spans the entire region,
    /// which is the state the in place growth path cares about.
    ///
    /// # Safety
    ///
    /// The region must be initialized, which [`Region::new`] guarantees.
    pub unsafe fn single_spanning_free_block(&self) -> Option<NonNull<Block>> {
        let first = self.start;

        let spans_everything = first.as_ref().size == self.total_size();

        (spans_everything && first.as_ref().is_free).then_some(first)
    }

    /// Writes a free block header of `size` bytes at the current end and
    /// extends the region past it.
    ///
    /// # Safety
    ///
    /// The host must have already granted `size` bytes past the current end.
    pub unsafe fn append_block(&mut self, size: usize) -> NonNull<Block> {
        let block = self.end.cast::<Block>();

        *block.as_ptr() = Block {
            size,
            is_free: true,
        };

        self.end = NonNull::new_unchecked(self.end.as_ptr().add(size));

        block
    }

    /// Extends the region by `increment` bytes without writing any header.
    /// Used when the single spanning block grows in place, the caller resizes
    /// that block itself.
    ///
    /// # Safety
    ///
    /// Same as [`Region::append_block`].
    pub unsafe fn extend(&mut self, increment: usize) {
        self.end = NonNull::new_unchecked(self.end.as_ptr().add(increment));
    }
}
