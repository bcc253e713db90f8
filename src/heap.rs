/*
 * Boot Heap (feature `boot-heap`)
 *
 * Global allocator for bare-metal embedders that have no allocator of
 * their own yet: a linked-list heap over a region the platform hands in
 * after its memory map is up. Hosted builds use the host allocator and
 * leave this feature off.
 */

use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the heap over `[start, start + size)`.
///
/// # Safety
///
/// The region must be mapped, writable, unused by anything else, and
/// this must be called exactly once, before the first allocation.
pub unsafe fn init(start: *mut u8, size: usize) {
    log::info!(
        "initializing boot heap: {:p} - {:p} ({} KiB)",
        start,
        start.wrapping_add(size),
        size / 1024
    );
    unsafe { ALLOCATOR.lock().init(start, size) };
}

/// Bytes currently handed out.
pub fn used() -> usize {
    ALLOCATOR.lock().used()
}

/// Bytes still available.
pub fn free() -> usize {
    ALLOCATOR.lock().free()
}
