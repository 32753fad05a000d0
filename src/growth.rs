use std::ptr::NonNull;

use crate::Pointer;

/// Host primitive that extends the contiguous address range managed by the
/// buddy allocator. This is the only boundary between the allocator and the
/// outside world, and deliberately the only thing that has to be swapped out
/// to test resource exhaustion.
///
/// The range only ever grows. There is no shrink operation and no teardown,
/// memory goes back to the operating system when the process exits.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - [`RegionSource::grow`] extends the range *contiguously*: the new bytes
///   start exactly at the previous end. The allocator tiles block headers
///   across the whole range and a gap would make it walk into unowned
///   memory.
/// - Granted bytes stay valid and writable for the lifetime of the source.
/// - Failure is reported as `None`, never by handing out a partial or
///   misplaced range.
pub unsafe trait RegionSource {
    /// Address of the current end of the managed range, without growing it.
    ///
    /// # Safety
    ///
    /// Only meaningful for the allocator that owns this source.
    unsafe fn current_end(&mut self) -> Pointer<u8>;

    /// Extends the range by `increment` bytes. Returns the new end on
    /// success or `None` on genuine resource exhaustion, in which case the
    /// range is left exactly as it was.
    ///
    /// # Safety
    ///
    /// Only meaningful for the allocator that owns this source.
    unsafe fn grow(&mut self, increment: usize) -> Pointer<u8>;
}

/// [`RegionSource`] over the classic unix program break. Equivalent to
/// growing the heap with `sbrk(2)`.
///
/// Do not mix this with any other user of the program break (including
/// `malloc` implementations that still use `brk`): a foreign move of the
/// break makes the range non contiguous, which violates the trait contract.
#[cfg(unix)]
pub struct ProgramBreak;

#[cfg(unix)]
impl ProgramBreak {
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl Default for ProgramBreak {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
unsafe impl RegionSource for ProgramBreak {
    unsafe fn current_end(&mut self) -> Pointer<u8> {
        // sbrk(0) just reports the current break.
        let brk = libc::sbrk(0);

        if brk == usize::MAX as *mut libc::c_void {
            return None;
        }

        Some(NonNull::new_unchecked(brk.cast()))
    }

    unsafe fn grow(&mut self, increment: usize) -> Pointer<u8> {
        if increment > libc::intptr_t::MAX as usize {
            return None;
        }

        // On success sbrk returns the previous break, so the new end is that
        // plus the increment.
        let previous = libc::sbrk(increment as libc::intptr_t);

        if previous == usize::MAX as *mut libc::c_void {
            return None;
        }

        Some(NonNull::new_unchecked(
            previous.cast::<u8>().add(increment),
        ))
    }
}

/// [`RegionSource`] for Windows, where nothing like `sbrk` exists. A large
/// range of virtual address space is reserved up front with `VirtualAlloc`
/// and pages are committed incrementally as the allocator grows. Reserved
/// but uncommitted pages cost address space only, not physical memory.
#[cfg(windows)]
pub struct ReservedRegion {
    base: *mut u8,
    committed: usize,
}

/// Amount of address space reserved by [`ReservedRegion`]. Growing past this
/// is reported as exhaustion.
#[cfg(windows)]
const RESERVATION_SIZE: usize = 1 << 32;

#[cfg(windows)]
impl ReservedRegion {
    pub const fn new() -> Self {
        Self {
            base: std::ptr::null_mut(),
            committed: 0,
        }
    }

    /// Reserves the address range on first use. Returns the base address.
    unsafe fn reserve(&mut self) -> Pointer<u8> {
        use windows::Win32::System::Memory;

        if self.base.is_null() {
            let address = Memory::VirtualAlloc(
                None,
                RESERVATION_SIZE,
                Memory::MEM_RESERVE,
                Memory::PAGE_NOACCESS,
            );

            self.base = address.cast();
        }

        NonNull::new(self.base)
    }
}

#[cfg(windows)]
impl Default for ReservedRegion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
unsafe impl RegionSource for ReservedRegion {
    unsafe fn current_end(&mut self) -> Pointer<u8> {
        let base = self.reserve()?;

        Some(NonNull::new_unchecked(base.as_ptr().add(self.committed)))
    }

    unsafe fn grow(&mut self, increment: usize) -> Pointer<u8> {
        use windows::Win32::System::Memory;

        let base = self.reserve()?;

        let committed = self.committed.checked_add(increment)?;
        if committed > RESERVATION_SIZE {
            return None;
        }

        let committed_end: *const std::ffi::c_void = base.as_ptr().add(self.committed).cast();
        let address = Memory::VirtualAlloc(
            Some(committed_end),
            increment,
            Memory::MEM_COMMIT,
            Memory::PAGE_READWRITE,
        );

        if address.is_null() {
            return None;
        }

        self.committed = committed;

        Some(NonNull::new_unchecked(base.as_ptr().add(self.committed)))
    }
}

/// The region source [`crate::Ruddy`] uses unless told otherwise.
#[cfg(unix)]
pub type DefaultSource = ProgramBreak;

#[cfg(windows)]
pub type DefaultSource = ReservedRegion;

/// Deterministic in-memory [`RegionSource`] with a hard byte limit. This is
/// how the tests exercise the exhaustion paths without touching the real
/// program break (which the test harness itself may be using through
/// `malloc`).
#[cfg(test)]
pub(crate) struct BoundedSource {
    buffer: Box<[Slot]>,
    served: usize,
    limit: usize,
}

/// Forces the backing buffer to start block-aligned, so growth increments
/// are served with no padding and tests can reason about exact byte limits.
#[cfg(test)]
#[derive(Clone)]
#[repr(align(16))]
struct Slot([u8; 16]);

#[cfg(test)]
impl BoundedSource {
    /// Source that will serve exactly `limit` bytes and then fail.
    pub fn new(limit: usize) -> Self {
        let slots = (limit + 15) / 16;

        Self {
            buffer: vec![Slot([0; 16]); slots].into_boxed_slice(),
            served: 0,
            limit,
        }
    }

    /// Makes every future [`RegionSource::grow`] call fail.
    pub fn exhaust(&mut self) {
        self.limit = self.served;
    }

    pub fn served(&self) -> usize {
        self.served
    }

    fn base(&mut self) -> *mut u8 {
        self.buffer.as_mut_ptr().cast()
    }
}

#[cfg(test)]
unsafe impl RegionSource for BoundedSource {
    unsafe fn current_end(&mut self) -> Pointer<u8> {
        let served = self.served;
        Some(NonNull::new_unchecked(self.base().add(served)))
    }

    unsafe fn grow(&mut self, increment: usize) -> Pointer<u8> {
        let served = self.served.checked_add(increment)?;

        if served > self.limit {
            return None;
        }

        self.served = served;

        Some(NonNull::new_unchecked(self.base().add(served)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_source_serves_up_to_its_limit() {
        let mut source = BoundedSource::new(8192);

        unsafe {
            let start = source.current_end().unwrap();

            let end = source.grow(4096).unwrap();
            assert_eq!(end.as_ptr() as usize - start.as_ptr() as usize, 4096);

            // Increments are contiguous.
            assert_eq!(source.current_end(), Some(end));

            let end = source.grow(4096).unwrap();
            assert_eq!(end.as_ptr() as usize - start.as_ptr() as usize, 8192);

            // Limit reached, everything from now on fails without moving
            // the end.
            assert_eq!(source.grow(16), None);
            assert_eq!(source.current_end(), Some(end));
        }
    }

    #[test]
    fn exhaust_cuts_off_growth_immediately() {
        let mut source = BoundedSource::new(1 << 20);

        unsafe {
            source.grow(4096).unwrap();
            source.exhaust();

            assert_eq!(source.grow(4096), None);
            assert_eq!(source.served(), 4096);
        }
    }
}
