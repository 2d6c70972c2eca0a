//! Memory management.
//!
//! Two layers, brought up in order: the bitmap frame allocator hands out
//! fixed 4 KiB physical frames, and the kernel heap carves variable-size
//! allocations out of an arena it grows one frame at a time. Both live in
//! global mutex singletons installed exactly once by [`init`].

pub mod bitmap_frame_allocator;
pub mod frame_allocator;
pub mod heap;

use bitmap_frame_allocator::BitmapFrameAllocator;
use frame_allocator::FRAME_ALLOCATOR;
use heap::{KernelHeap, KERNEL_HEAP};
use log::{info, warn};

pub use crate::constants::memory::{MemoryConfig, KERNEL_MEMORY};

/// One-time memory bring-up with the compiled-in layout.
pub fn init() {
    init_with_config(&KERNEL_MEMORY);
}

/// Construct the frame allocator over the usable region, reserve the heap
/// arena out of it, then install both singletons.
pub fn init_with_config(config: &MemoryConfig) {
    info!("Initializing memory management...");
    log_configuration(config);

    let mut frames = unsafe {
        BitmapFrameAllocator::init(config.usable_base, config.usable_size, config.frame_size)
    };
    // The initial arena is backed by frames the heap must own outright.
    frames.reserve_region(config.heap_base, config.heap_initial_size);
    *FRAME_ALLOCATOR.lock() = Some(frames);

    let heap = unsafe {
        KernelHeap::init(
            config.heap_base,
            config.heap_initial_size,
            config.heap_max_size,
        )
    };
    *KERNEL_HEAP.lock() = Some(heap);

    info!(
        "Memory management initialized for {} MB system",
        config.total_memory() / (1024 * 1024)
    );
}

fn log_configuration(config: &MemoryConfig) {
    let total_mb = config.total_memory() / (1024 * 1024);
    info!("Memory configuration:");
    info!("  Total memory: {} MB", total_mb);
    info!(
        "  Usable memory: {} MB (above {:#x})",
        config.usable_size / (1024 * 1024),
        config.usable_base
    );
    info!("  Page size: {} bytes", config.frame_size);
    info!("  Total pages: {}", config.total_frames());

    if total_mb < 16 {
        warn!("Memory configuration < 16MB may be insufficient");
    }
    if total_mb > 512 {
        warn!("Memory configuration > 512MB may be unrealistic");
    }
}
