//! Global frame allocator singleton.
//!
//! One allocator instance serves the whole kernel; every entry point goes
//! through the mutex, so interrupt-driven callers cannot observe a
//! half-updated bitmap.

use crate::memory::bitmap_frame_allocator::{BitmapFrameAllocator, FrameStats};
use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Global frame allocator, installed once by `memory::init`.
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

/// Allocate one physical frame from the global allocator.
pub fn alloc_frame() -> Option<PhysFrame> {
    with_frame_allocator(|allocator| allocator.allocate_frame())
}

/// Release a frame back to the global allocator.
pub fn dealloc_frame(frame: PhysFrame<Size4KiB>) {
    with_frame_allocator(|allocator| unsafe { allocator.deallocate_frame(frame) })
}

/// Release the frame containing a raw physical address.
pub fn free_frame(addr: PhysAddr) {
    with_frame_allocator(|allocator| allocator.free_frame(addr))
}

/// Snapshot of the global frame accounting counters.
pub fn frame_stats() -> FrameStats {
    with_frame_allocator(|allocator| allocator.stats())
}

/// Log the global frame accounting counters.
pub fn log_frame_stats() {
    with_frame_allocator(|allocator| allocator.log_stats())
}

pub fn with_frame_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator) -> R,
{
    let mut guard = FRAME_ALLOCATOR.lock();
    match &mut *guard {
        Some(allocator) => f(allocator),
        None => panic!("Frame allocator does not exist."),
    }
}
