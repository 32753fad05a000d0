use std::{mem, ptr::NonNull};

/// Block header size in bytes. See [`Block`].
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// Alignment of [`Block`], which is also the alignment of every payload
/// pointer we hand out, because payloads start right after a header and all
/// block sizes are multiples of the header size.
pub(crate) const BLOCK_ALIGN: usize = mem::align_of::<Block>();

/// The smallest total size a block can ever have. A block of this size still
/// carries [`BLOCK_HEADER_SIZE`] bytes of payload, so even the tiniest
/// allocation gets a non empty content area.
pub(crate) const MIN_BLOCK_SIZE: usize = 2 * BLOCK_HEADER_SIZE;

/// Header of a memory block. The managed region is an unbroken sequence of
/// blocks, each one a power of two in total size, laid out like this:
///
/// ```text
/// +--------------------+ <------+
/// | size               |        |
/// +--------------------+        | Block (header)
/// | is_free (1 byte)   |        |
/// +--------------------+        |
/// | padding            |        |
/// +--------------------+ <------+
/// |      Content       | <------+
/// |        ...         |        | Addressable content,
/// |        ...         |        | size - BLOCK_HEADER_SIZE bytes.
/// |        ...         |        |
/// +--------------------+ <------+
/// ```
///
/// There are no next/prev pointers: since blocks tile the region with no gaps
/// the next header is always found `size` bytes after the current one, and
/// the buddy of a block is a pure function of its offset and size (see
/// [`crate::allocator`]). The struct is over-aligned so that content
/// addresses satisfy the strictest fundamental alignment, like `malloc`.
#[repr(C, align(16))]
pub(crate) struct Block {
    /// Total size of the block in bytes, header included. Always a power of
    /// two and at least [`MIN_BLOCK_SIZE`] (the very first block of a region
    /// may be larger, never smaller).
    pub size: usize,
    /// Whether this block can be used for an allocation.
    pub is_free: bool,
}

impl Block {
    /// Returns a pointer to the [`Block`] whose content starts at `address`.
    ///
    /// ```text
    /// +-------------+
    /// |    Block    | <- Returned pointer points here.
    /// +-------------+
    /// |   Content   | <- Given address points here.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// This is the one place in the crate where caller pointers are mapped
    /// back to allocator metadata.
    ///
    /// # Safety
    ///
    /// Caller must guarantee that `address` was previously returned by an
    /// allocation and not freed since. Anything else is undefined behaviour,
    /// there is no way to validate a foreign pointer here.
    #[inline]
    pub unsafe fn from_payload_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the content address of `block`, which is what the allocator
    /// users receive.
    ///
    /// # Safety
    ///
    /// `block` must point to a valid header located inside the managed
    /// region. The returned address is safe to use for up to
    /// `block.size - BLOCK_HEADER_SIZE` bytes.
    #[inline]
    pub unsafe fn payload_address_of(block: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().offset(1)).cast()
    }

    /// Header of the block physically located right after `block`. Only
    /// meaningful while the returned address is below the region end, the
    /// last block of the region has no neighbor.
    ///
    /// # Safety
    ///
    /// `block` must be a valid header and tiling must hold, otherwise the
    /// result points into the middle of nowhere.
    #[inline]
    pub unsafe fn neighbor_of(block: NonNull<Self>) -> NonNull<Self> {
        let address = block.as_ptr().cast::<u8>().add(block.as_ref().size);
        NonNull::new_unchecked(address.cast())
    }

    /// Content bytes this block can hold.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.size - BLOCK_HEADER_SIZE
    }

    /// Content bytes each half would hold if this block was split in two.
    #[inline]
    pub fn half_usable_size(&self) -> usize {
        self.size / 2 - BLOCK_HEADER_SIZE
    }
}
