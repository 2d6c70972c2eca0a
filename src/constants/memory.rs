//! Memory geometry.
//!
//! Everything here is compile-time configuration: the physical region handed
//! to the frame allocator, the heap arena carved out of it, and the unit
//! sizes both allocators work in.

/// Size of one physical page frame in bytes.
pub const FRAME_SIZE: usize = 4096;
/// The heap grows in whole pages; pages and frames are the same size here.
pub const PAGE_SIZE: usize = FRAME_SIZE;

/// Physical memory the kernel is compiled for, in MiB.
pub const KERNEL_MEMORY_MB: usize = 64;

/// Conventional memory below 1 MiB is left alone.
pub const USABLE_REGION_START: usize = 0x10_0000;
/// Bytes of physical memory tracked by the frame allocator.
pub const USABLE_REGION_SIZE: usize = KERNEL_MEMORY_MB * 1024 * 1024 - USABLE_REGION_START;

/// Base address of the kernel heap arena.
pub const HEAP_START: usize = 0x40_0000;
/// Size of the initial heap arena segment.
pub const HEAP_INITIAL_SIZE: usize = 0x10_0000;
/// Ceiling on the heap across all growth, initial segment included.
pub const HEAP_MAX_SIZE: usize = 0x40_0000;

/// Alignment unit for heap blocks; applied to header plus payload.
pub const HEAP_ALIGNMENT: usize = 8;

/// Bits per word of the frame bitmap.
pub const BITMAP_ENTRY_BITS: usize = 64;

/// Memory layout consumed by `memory::init_with_config`.
///
/// The kernel boots with [`KERNEL_MEMORY`]; tests build their own over
/// host buffers.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    pub usable_base: usize,
    pub usable_size: usize,
    pub frame_size: usize,
    pub heap_base: usize,
    pub heap_initial_size: usize,
    pub heap_max_size: usize,
}

impl MemoryConfig {
    /// Number of frames the bitmap tracks.
    pub const fn total_frames(&self) -> usize {
        self.usable_size / self.frame_size
    }

    /// Top of physical memory, region base included.
    pub const fn total_memory(&self) -> usize {
        self.usable_base + self.usable_size
    }
}

/// The layout the kernel boots with.
pub const KERNEL_MEMORY: MemoryConfig = MemoryConfig {
    usable_base: USABLE_REGION_START,
    usable_size: USABLE_REGION_SIZE,
    frame_size: FRAME_SIZE,
    heap_base: HEAP_START,
    heap_initial_size: HEAP_INITIAL_SIZE,
    heap_max_size: HEAP_MAX_SIZE,
};
