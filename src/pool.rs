use std::{mem, ptr, ptr::NonNull};

use log::debug;

use crate::{growth::RegionSource, Pointer};

/// Fixed size block allocator. Every allocation is exactly `BLOCK_SIZE`
/// bytes, which removes headers, splitting and coalescing entirely: a freed
/// block becomes a node of an intrusive free list threaded through the
/// blocks themselves, and allocation pops that list before falling back to
/// bumping into untouched capacity.
///
/// ```text
///  free_head
///      |
///      v
/// +---------+---------+---------+---------+----------------+
/// | free    | used    | free    | used    | untouched      |
/// |  next --+---------+-> None  |         |                |
/// +---------+---------+---------+---------+----------------+
///                                         ^                ^
///                                        front            end
/// ```
///
/// Capacity comes from a [`RegionSource`], one chunk of blocks at a time.
/// Nothing here requires the chunks to be contiguous, but the sources in
/// this crate grow that way anyway.
pub struct Pool<S: RegionSource, const BLOCK_SIZE: usize> {
    source: S,
    /// Most recently freed block, `None` when the list is empty.
    free_head: Pointer<FreeNode>,
    /// First untouched byte of the current chunk.
    front: *mut u8,
    /// End of the current chunk.
    end: *mut u8,
}

/// Lives inside a freed block. The block must be big enough and aligned
/// enough to hold it, which [`Pool::new`] asserts.
struct FreeNode {
    next: Pointer<FreeNode>,
}

/// Free list nodes are pointers, so blocks must be handed out on pointer
/// boundaries.
const POOL_ALIGN: usize = mem::align_of::<FreeNode>();

/// Rough chunk size in bytes. Actual chunks are whole multiples of the block
/// size, at least one block.
const CHUNK_HINT: usize = 4096;

impl<S: RegionSource, const BLOCK_SIZE: usize> Pool<S, BLOCK_SIZE> {
    /// Number of bytes requested from the source per chunk.
    const CHUNK_SIZE: usize = if BLOCK_SIZE >= CHUNK_HINT {
        BLOCK_SIZE
    } else {
        (CHUNK_HINT / BLOCK_SIZE) * BLOCK_SIZE
    };

    /// Creates the pool. No memory is requested from `source` until the
    /// first call to [`Pool::allocate`].
    pub const fn new(source: S) -> Self {
        assert!(
            BLOCK_SIZE.is_power_of_two() && BLOCK_SIZE >= mem::size_of::<FreeNode>(),
            "pool blocks must be a power of two and hold at least one pointer",
        );

        Self {
            source,
            free_head: None,
            front: ptr::null_mut(),
            end: ptr::null_mut(),
        }
    }

    /// Hands out one block of `BLOCK_SIZE` bytes, or `None` when the source
    /// cannot grow any further.
    ///
    /// # Safety
    ///
    /// The returned address is valid for `BLOCK_SIZE` bytes until it is
    /// passed to [`Pool::free`].
    pub unsafe fn allocate(&mut self) -> Pointer<u8> {
        // Freed blocks first, most recently freed on top.
        if let Some(node) = self.free_head {
            self.free_head = node.as_ref().next;
            return Some(node.cast());
        }

        if self.front == self.end {
            self.grow_chunk()?;
        }

        let block = self.front;
        self.front = self.front.add(BLOCK_SIZE);

        Some(NonNull::new_unchecked(block))
    }

    /// Returns a block to the pool by pushing it onto the free list.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this pool and not freed since.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        let node = address.cast::<FreeNode>();

        node.as_ptr().write(FreeNode {
            next: self.free_head,
        });

        self.free_head = Some(node);
    }

    /// Obtains the next chunk of blocks from the source. The first chunk
    /// also absorbs whatever padding is needed to start block aligned.
    unsafe fn grow_chunk(&mut self) -> Pointer<u8> {
        let padding = if self.front.is_null() {
            let raw = self.source.current_end()?;
            let address = raw.as_ptr() as usize;
            (POOL_ALIGN - address % POOL_ALIGN) % POOL_ALIGN
        } else {
            0
        };

        let new_end = self.source.grow(padding + Self::CHUNK_SIZE)?;

        self.end = new_end.as_ptr();
        self.front = new_end.as_ptr().sub(Self::CHUNK_SIZE);

        debug!("pool chunk of {} bytes at {:?}", Self::CHUNK_SIZE, self.front);

        Some(new_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::growth::BoundedSource;

    type TestPool = Pool<BoundedSource, 64>;

    #[test]
    fn blocks_come_out_block_sized_apart() {
        let mut pool = TestPool::new(BoundedSource::new(4096));

        unsafe {
            let first = pool.allocate().unwrap();
            let second = pool.allocate().unwrap();

            assert_eq!(
                second.as_ptr() as usize - first.as_ptr() as usize,
                64
            );
        }
    }

    #[test]
    fn the_free_list_is_reused_in_lifo_order() {
        let mut pool = TestPool::new(BoundedSource::new(4096));

        unsafe {
            let first = pool.allocate().unwrap();
            let second = pool.allocate().unwrap();
            let third = pool.allocate().unwrap();

            pool.free(first);
            pool.free(third);

            // Most recently freed comes back first, and no fresh capacity
            // is consumed while freed blocks remain.
            assert_eq!(pool.allocate(), Some(third));
            assert_eq!(pool.allocate(), Some(first));

            let fresh = pool.allocate().unwrap();
            assert_eq!(
                fresh.as_ptr() as usize - second.as_ptr() as usize,
                2 * 64
            );
        }
    }

    #[test]
    fn a_full_chunk_triggers_growth() {
        let mut pool = TestPool::new(BoundedSource::new(2 * 4096));

        unsafe {
            for _ in 0..(4096 / 64) {
                pool.allocate().unwrap();
            }

            // The 65th block lives in a second chunk.
            pool.allocate().unwrap();
        }
    }

    #[test]
    fn exhaustion_fails_cleanly_and_freed_blocks_still_serve() {
        let mut pool = TestPool::new(BoundedSource::new(4096));

        unsafe {
            let mut blocks = Vec::new();
            for _ in 0..(4096 / 64) {
                blocks.push(pool.allocate().unwrap());
            }

            assert_eq!(pool.allocate(), None);

            pool.free(blocks[10]);
            assert_eq!(pool.allocate(), Some(blocks[10]));
        }
    }

    #[test]
    fn block_content_survives_until_freed() {
        let mut pool = TestPool::new(BoundedSource::new(4096));

        unsafe {
            let first = pool.allocate().unwrap();
            let second = pool.allocate().unwrap();

            first.as_ptr().write_bytes(0x11, 64);
            second.as_ptr().write_bytes(0x22, 64);

            for i in 0..64 {
                assert_eq!(*first.as_ptr().add(i), 0x11);
                assert_eq!(*second.as_ptr().add(i), 0x22);
            }
        }
    }
}
