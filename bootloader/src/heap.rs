//! Global heap
//!
//! One `linked_list_allocator` heap over a block the back end claims from
//! firmware (UEFI pages or an E820 range). It lives until hand-off; the
//! block is reported as reclaimable so the kernel gets it back.

use linked_list_allocator::LockedHeap;

/// Size of the loader heap. Holds disk caches, decompression state and
/// the memory bookkeeping.
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// # Safety
/// `base..base + size` must be unused RAM that stays reserved for the
/// loader; call once, before the first allocation.
pub unsafe fn init(base: *mut u8, size: usize) {
    ALLOCATOR.lock().init(base, size);
}
