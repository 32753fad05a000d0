//! `ruddy` is a small family of heap memory managers meant to replace a
//! general purpose allocator inside a single process:
//!
//! - [`BuddyAllocator`]: the main component. Arbitrary size allocation,
//!   deallocation and reallocation over one contiguous memory region that
//!   grows on demand, using power of two block splitting and buddy
//!   coalescing.
//! - [`Arena`]: bump pointer allocator over a fixed byte region. Individual
//!   allocations cannot be freed, only the whole arena at once.
//! - [`Pool`]: fixed size block allocator backed by a free list.
//!
//! The three are independent, they share no state and never call each other.
//!
//! The buddy allocator obtains memory through the [`RegionSource`] trait,
//! which models a host primitive that extends a contiguous address range
//! (think `sbrk`). On unix the crate ships [`ProgramBreak`], on Windows a
//! reserve/commit source based on `VirtualAlloc`. Any other implementation
//! works as long as it respects the trait contract, which also makes the
//! out of memory paths testable without actually exhausting the machine.
//!
//! [`BuddyAllocator`] itself is single threaded and needs `&mut self` for
//! every operation. [`Ruddy`] is the opt-in process wide wrapper that puts
//! the whole thing behind a [`std::sync::Mutex`] and implements
//! [`std::alloc::GlobalAlloc`].

use std::ptr::NonNull;

mod allocator;
mod arena;
mod block;
mod global;
mod growth;
mod pool;
mod region;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case, and `None` doubles as the failure sentinel of every fallible
/// operation in this crate.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::BuddyAllocator;
pub use arena::Arena;
pub use global::Ruddy;
#[cfg(unix)]
pub use growth::ProgramBreak;
#[cfg(windows)]
pub use growth::ReservedRegion;
pub use growth::{DefaultSource, RegionSource};
pub use pool::Pool;
