//! Kernel heap
//!
//! Freestanding global allocator, fed by the boot code once the physical
//! map is known. Hosted test builds use the host allocator instead.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the allocator its arena. Call exactly once, before anything
/// allocates.
///
/// # Safety
/// `start..start + size` must be unused, writable memory.
pub unsafe fn init(start: *mut u8, size: usize) {
    ALLOCATOR.lock().init(start, size);
}
