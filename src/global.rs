use std::{
    alloc::{GlobalAlloc, Layout},
    ptr,
    sync::Mutex,
};

use crate::{
    allocator::BuddyAllocator,
    block::BLOCK_ALIGN,
    growth::{DefaultSource, RegionSource},
};

/// Process wide buddy allocator. This is just a [`BuddyAllocator`] behind a
/// [`Mutex`], which makes it usable as a `static` and as the global
/// allocator:
///
/// ```ignore
/// use ruddy::Ruddy;
///
/// #[global_allocator]
/// static ALLOCATOR: Ruddy = Ruddy::new();
/// ```
///
/// The default region source is the platform growth primitive (`sbrk` on
/// Unix, a reserved virtual address range on Windows). Nothing else in the
/// crate hides behind a global, callers that want several independent
/// allocators create [`BuddyAllocator`] values directly.
pub struct Ruddy<S: RegionSource = DefaultSource> {
    allocator: Mutex<BuddyAllocator<S>>,
}

// The mutex serializes every access to the inner allocator and the raw
// pointers it hands out are never dereferenced here.
unsafe impl<S: RegionSource> Sync for Ruddy<S> {}

impl Ruddy<DefaultSource> {
    pub const fn new() -> Self {
        Self::with_source(DefaultSource::new())
    }
}

impl Default for Ruddy<DefaultSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RegionSource> Ruddy<S> {
    /// Builds the wrapper over a caller supplied region source.
    pub const fn with_source(source: S) -> Self {
        Self {
            allocator: Mutex::new(BuddyAllocator::new(source)),
        }
    }
}

unsafe impl<S: RegionSource> GlobalAlloc for Ruddy<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Block payloads are aligned to the header boundary and nothing
        // stricter. Stricter layouts must be refused, not silently
        // misaligned.
        if layout.align() > BLOCK_ALIGN {
            return ptr::null_mut();
        }

        let Ok(mut allocator) = self.allocator.lock() else {
            return ptr::null_mut();
        };

        match allocator.allocate(layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        let Some(address) = ptr::NonNull::new(address) else {
            return;
        };

        if let Ok(mut allocator) = self.allocator.lock() {
            allocator.free(address);
        }
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return ptr::null_mut();
        }

        let Some(address) = ptr::NonNull::new(address) else {
            return ptr::null_mut();
        };

        let Ok(mut allocator) = self.allocator.lock() else {
            return ptr::null_mut();
        };

        match allocator.reallocate(address, new_size) {
            Some(new_address) => new_address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
