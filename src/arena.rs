use std::{mem, ptr::NonNull};

use crate::Pointer;

/// Bump pointer allocator over a fixed region of bytes, either owned by the
/// arena ([`Arena::with_capacity`]) or provided by the caller
/// ([`Arena::from_raw_parts`]). Allocation is a pointer increment, there is
/// no per-allocation bookkeeping and no way to free a single allocation:
/// [`Arena::reset`] reclaims everything at once, and an owning arena
/// releases its region on drop.
///
/// ```text
/// +--------------------------+----------------------------------+
/// | allocated . . . . . . .  | available                        |
/// +--------------------------+----------------------------------+
/// ^                          ^                                  ^
/// base                      front                              end
/// ```
///
/// Allocations are aligned to the machine word, which wastes at most
/// `align - 1` bytes per allocation and makes the returned addresses valid
/// for any primitive type.
pub struct Arena {
    /// First byte of the region.
    base: NonNull<u8>,
    /// Region length in bytes.
    size: usize,
    /// Offset of the first available byte.
    front: usize,
    /// Backing buffer of an owning arena, dropped with the arena. `None`
    /// when the region was handed over through
    /// [`Arena::from_raw_parts`]. Word sized elements keep `base` aligned.
    storage: Option<Box<[usize]>>,
}

/// Every allocation starts on a machine word boundary.
const ARENA_ALIGN: usize = mem::align_of::<usize>();

impl Arena {
    /// Builds an arena that owns its region: `size` bytes allocated on the
    /// heap, released when the arena is dropped.
    pub fn with_capacity(size: usize) -> Self {
        let words = size.div_ceil(mem::size_of::<usize>());
        let mut storage = vec![0usize; words].into_boxed_slice();

        // SAFETY: a boxed slice pointer is never null, even when empty.
        let base = unsafe { NonNull::new_unchecked(storage.as_mut_ptr().cast::<u8>()) };

        Self {
            base,
            size,
            front: 0,
            storage: Some(storage),
        }
    }

    /// Builds an arena over `size` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base .. base + size` must be valid writable memory, aligned to the
    /// machine word, that outlives the arena and is not used by anything
    /// else while the arena is alive.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, size: usize) -> Self {
        Self {
            base,
            size,
            front: 0,
            storage: None,
        }
    }

    /// Hands out `size` bytes, or `None` once the region cannot hold the
    /// request. Exhaustion is not fatal, the arena keeps serving smaller
    /// requests that still fit.
    pub fn allocate(&mut self, size: usize) -> Pointer<u8> {
        // Round the current front up to the allocation alignment. The
        // padding is lost until the next reset.
        let aligned = self.front.checked_add(ARENA_ALIGN - 1)? & !(ARENA_ALIGN - 1);
        let next = aligned.checked_add(size)?;

        if next > self.size {
            return None;
        }

        self.front = next;

        // SAFETY: `aligned < next <= size`, so the address is in bounds of
        // the owned or caller-provided region.
        unsafe { Some(NonNull::new_unchecked(self.base.as_ptr().add(aligned))) }
    }

    /// Discards every allocation at once. Previously returned addresses must
    /// not be used afterwards.
    pub fn reset(&mut self) {
        self.front = 0;
    }

    /// Bytes still available, not counting alignment padding of future
    /// allocations.
    pub fn remaining(&self) -> usize {
        self.size - self.front
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Buffer([u8; 256]);

    fn buffer() -> Box<Buffer> {
        Box::new(Buffer([0; 256]))
    }

    #[test]
    fn bump_allocations_are_sequential_and_aligned() {
        let mut buffer = buffer();
        let base = NonNull::new(buffer.0.as_mut_ptr()).unwrap();
        let mut arena = unsafe { Arena::from_raw_parts(base, 256) };

        let first = arena.allocate(10).unwrap();
        let second = arena.allocate(10).unwrap();

        assert_eq!(first, base);
        // 10 rounds up to the next word boundary.
        assert_eq!(
            second.as_ptr() as usize - first.as_ptr() as usize,
            (10 + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
        );
        assert_eq!(second.as_ptr() as usize % ARENA_ALIGN, 0);
    }

    #[test]
    fn exhaustion_is_not_fatal() {
        let mut buffer = buffer();
        let base = NonNull::new(buffer.0.as_mut_ptr()).unwrap();
        let mut arena = unsafe { Arena::from_raw_parts(base, 256) };

        arena.allocate(200).unwrap();

        assert_eq!(arena.allocate(100), None);
        // A request that still fits keeps working after a failure.
        arena.allocate(40).unwrap();
    }

    #[test]
    fn reset_reclaims_the_whole_region() {
        let mut buffer = buffer();
        let base = NonNull::new(buffer.0.as_mut_ptr()).unwrap();
        let mut arena = unsafe { Arena::from_raw_parts(base, 256) };

        let first = arena.allocate(250).unwrap();
        assert!(arena.remaining() < 8);

        arena.reset();

        assert_eq!(arena.remaining(), 256);
        assert_eq!(arena.allocate(250), Some(first));
    }

    #[test]
    fn an_owning_arena_manages_its_own_region() {
        let mut arena = Arena::with_capacity(256);

        assert_eq!(arena.remaining(), 256);

        let first = arena.allocate(100).unwrap();
        assert_eq!(first.as_ptr() as usize % ARENA_ALIGN, 0);

        unsafe {
            first.as_ptr().write_bytes(0x7E, 100);
        }

        assert_eq!(arena.allocate(200), None);

        arena.reset();
        assert_eq!(arena.allocate(200), Some(first));
    }

    #[test]
    fn zero_size_allocations_do_not_consume_space() {
        let mut buffer = buffer();
        let base = NonNull::new(buffer.0.as_mut_ptr()).unwrap();
        let mut arena = unsafe { Arena::from_raw_parts(base, 256) };

        arena.allocate(0).unwrap();
        arena.allocate(0).unwrap();

        assert_eq!(arena.remaining(), 256);
    }
}
