//! The kernel heap.
//!
//! `kmalloc`/`kfree` over a doubly linked, address-ordered list of block
//! headers covering the whole arena. Allocation is first-fit with block
//! splitting; freeing coalesces address-adjacent neighbors. When no free
//! block fits, the heap grows by whole frames taken from the frame
//! allocator, up to a configured maximum. Grown frames are never returned.

use crate::constants::memory::{HEAP_ALIGNMENT, PAGE_SIZE};
use crate::memory::frame_allocator::with_frame_allocator;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use log::{debug, error, info, warn};
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, Size4KiB};

/// Bytes of metadata in front of every heap block.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Metadata prefixed to every heap block.
///
/// `size` covers the header and the payload together. `next` and `prev`
/// are position lookups into the arena, not owning pointers; the arena
/// owns all header storage.
#[repr(C)]
pub struct BlockHeader {
    size: usize,
    used: bool,
    next: Option<NonNull<BlockHeader>>,
    prev: Option<NonNull<BlockHeader>>,
}

/// Read-only snapshot of the heap accounting counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub total_size: usize,
    pub used_size: usize,
    pub free_size: usize,
    pub total_allocations: u64,
    pub total_frees: u64,
}

/// Per-block view produced by the list walk.
#[derive(Debug, Clone, Copy)]
struct BlockInfo {
    address: usize,
    size: usize,
    used: bool,
}

pub struct KernelHeap {
    head: Option<NonNull<BlockHeader>>,
    tail: Option<NonNull<BlockHeader>>,
    total_size: usize,
    used_size: usize,
    max_size: usize,
    total_allocations: u64,
    total_frees: u64,
}

unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// Create a heap whose first free block spans the whole initial arena.
    ///
    /// `used_size` starts at `HEADER_SIZE`: the first header is bookkeeping
    /// overhead even while its block is still free.
    ///
    /// # Safety
    /// The arena must be writable memory exclusively handed over to the
    /// heap, at least `HEADER_SIZE` bytes large, with `arena_base` nonzero
    /// and aligned to `HEAP_ALIGNMENT`.
    pub unsafe fn init(arena_base: usize, initial_size: usize, max_size: usize) -> Self {
        assert!(arena_base != 0);
        assert!(arena_base % HEAP_ALIGNMENT == 0);
        assert!(initial_size >= HEADER_SIZE);

        let first = arena_base as *mut BlockHeader;
        unsafe {
            first.write(BlockHeader {
                size: initial_size,
                used: false,
                next: None,
                prev: None,
            });
        }
        let first = NonNull::new(first);

        info!("Heap initialized at {:#x}", arena_base);
        info!("  Initial heap size: {} KB", initial_size / 1024);

        Self {
            head: first,
            tail: first,
            total_size: initial_size,
            used_size: HEADER_SIZE,
            max_size,
            total_allocations: 0,
            total_frees: 0,
        }
    }

    /// Allocate `size` bytes, growing the arena through `frames` when no
    /// free block fits.
    ///
    /// Returns null for zero-sized requests and on heap exhaustion; both
    /// leave the heap untouched.
    pub fn kmalloc(&mut self, size: usize, frames: &mut impl FrameAllocator<Size4KiB>) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let Some(total_size) = size
            .checked_add(HEADER_SIZE)
            .and_then(|n| align_up(n, HEAP_ALIGNMENT))
        else {
            warn!("kmalloc request of {} bytes overflows", size);
            return ptr::null_mut();
        };

        if let Some(payload) = self.take_first_fit(total_size) {
            return payload;
        }

        debug!("No suitable block for {} bytes, expanding heap", total_size);
        if self.expand(total_size, frames) {
            // Retry against the grown list, not just the appended tail.
            if let Some(payload) = self.take_first_fit(total_size) {
                return payload;
            }
        }

        error!("Heap exhausted: cannot allocate {} bytes", size);
        ptr::null_mut()
    }

    /// Release an allocation returned by [`KernelHeap::kmalloc`].
    ///
    /// Null is a no-op. Freeing a block that is already free is reported
    /// and skipped.
    ///
    /// # Safety
    /// `ptr` must be null or a payload address previously returned by
    /// `kmalloc` on this heap and not freed since.
    pub unsafe fn kfree(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let block = unsafe { ptr.sub(HEADER_SIZE) } as *mut BlockHeader;
        unsafe {
            if !(*block).used {
                warn!("Double free detected at {:#x}", ptr as usize);
                return;
            }

            (*block).used = false;
            self.used_size -= (*block).size;
            self.total_frees += 1;

            self.merge_free_block(block);
        }
    }

    /// Read-only snapshot of the accounting counters.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total_size: self.total_size,
            used_size: self.used_size,
            free_size: self.total_size - self.used_size,
            total_allocations: self.total_allocations,
            total_frees: self.total_frees,
        }
    }

    /// Log the heap accounting counters.
    pub fn log_stats(&self) {
        let stats = self.stats();
        let efficiency = if stats.total_size > 0 {
            stats.used_size * 100 / stats.total_size
        } else {
            0
        };
        info!("Heap statistics:");
        info!("  Total heap size:    {} KB", stats.total_size / 1024);
        info!("  Used memory:        {} KB", stats.used_size / 1024);
        info!("  Free memory:        {} KB", stats.free_size / 1024);
        info!("  Memory efficiency:  {}%", efficiency);
        info!("  Total allocations:  {}", stats.total_allocations);
        info!("  Total frees:        {}", stats.total_frees);
        info!(
            "  Active allocations: {}",
            stats.total_allocations - stats.total_frees
        );
    }

    /// Log every block in list order: payload address, state, payload size.
    pub fn log_dump(&self) {
        info!("Heap dump:");
        let mut used_blocks = 0usize;
        let mut free_blocks = 0usize;
        for (index, block) in self.blocks().enumerate() {
            info!(
                "  Block {}: {:#x} [{}] size: {} bytes",
                index,
                block.address + HEADER_SIZE,
                if block.used { "USED" } else { "FREE" },
                block.size - HEADER_SIZE,
            );
            if block.used {
                used_blocks += 1;
            } else {
                free_blocks += 1;
            }
        }
        info!(
            "Total blocks: {} (Used: {}, Free: {})",
            used_blocks + free_blocks,
            used_blocks,
            free_blocks
        );
    }

    /// First-fit walk: claim the first free block of at least `total_size`
    /// bytes and return its payload address.
    fn take_first_fit(&mut self, total_size: usize) -> Option<*mut u8> {
        let mut current = self.head;
        while let Some(block) = current {
            let block = block.as_ptr();
            unsafe {
                if !(*block).used && (*block).size >= total_size {
                    self.split_block(block, total_size);

                    (*block).used = true;
                    self.used_size += (*block).size;
                    self.total_allocations += 1;

                    return Some((block as *mut u8).add(HEADER_SIZE));
                }
                current = (*block).next;
            }
        }
        None
    }

    /// Cut `block` down to `size` bytes, giving the remainder its own free
    /// header spliced in immediately after. Remainders too small to carry a
    /// header stay in the block as internal fragmentation.
    unsafe fn split_block(&mut self, block: *mut BlockHeader, size: usize) {
        unsafe {
            let remaining = (*block).size - size;
            if remaining <= HEADER_SIZE + HEAP_ALIGNMENT {
                return;
            }

            let new_block = (block as *mut u8).add(size) as *mut BlockHeader;
            new_block.write(BlockHeader {
                size: remaining,
                used: false,
                next: (*block).next,
                prev: NonNull::new(block),
            });
            let new_block = NonNull::new(new_block);

            if let Some(next) = (*block).next {
                (*next.as_ptr()).prev = new_block;
            }
            (*block).next = new_block;
            (*block).size = size;

            if self.tail == NonNull::new(block) {
                self.tail = new_block;
            }
        }
    }

    /// Grow the arena by whole frames until it can hold `total_size` more
    /// bytes, respecting the configured maximum.
    fn expand(&mut self, total_size: usize, frames: &mut impl FrameAllocator<Size4KiB>) -> bool {
        if self.total_size >= self.max_size {
            error!("Maximum heap size reached ({} KB)", self.max_size / 1024);
            return false;
        }

        let pages_needed = total_size.div_ceil(PAGE_SIZE);
        let expand_size = pages_needed * PAGE_SIZE;
        if self.total_size + expand_size > self.max_size {
            error!(
                "Expansion by {} KB would exceed the maximum heap size",
                expand_size / 1024
            );
            return false;
        }

        for _ in 0..pages_needed {
            let Some(frame) = frames.allocate_frame() else {
                // Frames appended so far stay part of the arena.
                error!("Out of physical memory during heap expansion");
                return false;
            };
            let base = frame.start_address().as_u64() as usize;
            unsafe { self.append_frame(base, PAGE_SIZE) };
        }

        debug!("Heap expanded by {} bytes", expand_size);
        true
    }

    /// Attach one granted frame at the tail of the block list. A free tail
    /// ending exactly at `base` is extended in place; anything else starts
    /// a new arena segment.
    unsafe fn append_frame(&mut self, base: usize, size: usize) {
        self.total_size += size;

        if let Some(tail) = self.tail {
            let tail = tail.as_ptr();
            unsafe {
                if !(*tail).used && tail as usize + (*tail).size == base {
                    (*tail).size += size;
                    return;
                }
            }
        }

        let block = base as *mut BlockHeader;
        unsafe {
            block.write(BlockHeader {
                size,
                used: false,
                next: None,
                prev: self.tail,
            });
        }
        let block = NonNull::new(block);

        match self.tail {
            Some(tail) => unsafe { (*tail.as_ptr()).next = block },
            None => self.head = block,
        }
        self.tail = block;
    }

    /// Absorb the next block if it is free and address-adjacent, then let
    /// an adjacent free predecessor absorb `block` the same way. The
    /// forward-then-backward order collapses up to three neighboring free
    /// regions into one. List neighbors separated by a segment gap are
    /// never merged.
    unsafe fn merge_free_block(&mut self, block: *mut BlockHeader) {
        unsafe {
            if let Some(next) = (*block).next {
                let next = next.as_ptr();
                if !(*next).used && block as usize + (*block).size == next as usize {
                    (*block).size += (*next).size;
                    (*block).next = (*next).next;
                    match (*block).next {
                        Some(after) => (*after.as_ptr()).prev = NonNull::new(block),
                        None => self.tail = NonNull::new(block),
                    }
                }
            }

            if let Some(prev) = (*block).prev {
                let prev = prev.as_ptr();
                if !(*prev).used && prev as usize + (*prev).size == block as usize {
                    (*prev).size += (*block).size;
                    (*prev).next = (*block).next;
                    match (*block).next {
                        Some(after) => (*after.as_ptr()).prev = NonNull::new(prev),
                        None => self.tail = NonNull::new(prev),
                    }
                }
            }
        }
    }

    /// Walk the block list front to back.
    fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut current = self.head;
        core::iter::from_fn(move || {
            let block = current?.as_ptr();
            unsafe {
                current = (*block).next;
                Some(BlockInfo {
                    address: block as usize,
                    size: (*block).size,
                    used: (*block).used,
                })
            }
        })
    }
}

/// Round `value` up to the next multiple of `align`; `None` on overflow.
fn align_up(value: usize, align: usize) -> Option<usize> {
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Global kernel heap, installed once by `memory::init`.
pub static KERNEL_HEAP: Mutex<Option<KernelHeap>> = Mutex::new(None);

/// Allocate from the global kernel heap.
///
/// Lock order is heap before frame allocator; free paths take only one of
/// the two, so the order is consistent everywhere.
pub fn kmalloc(size: usize) -> *mut u8 {
    let mut guard = KERNEL_HEAP.lock();
    let heap = guard.as_mut().expect("Kernel heap does not exist.");
    with_frame_allocator(|frames| heap.kmalloc(size, frames))
}

/// Release an allocation back to the global kernel heap.
///
/// # Safety
/// Same contract as [`KernelHeap::kfree`].
pub unsafe fn kfree(ptr: *mut u8) {
    let mut guard = KERNEL_HEAP.lock();
    let heap = guard.as_mut().expect("Kernel heap does not exist.");
    unsafe { heap.kfree(ptr) };
}

/// Snapshot of the global heap counters.
pub fn heap_stats() -> HeapStats {
    let guard = KERNEL_HEAP.lock();
    guard.as_ref().expect("Kernel heap does not exist.").stats()
}

/// Log the global heap counters.
pub fn log_heap_stats() {
    let guard = KERNEL_HEAP.lock();
    guard
        .as_ref()
        .expect("Kernel heap does not exist.")
        .log_stats();
}

/// Log the global heap block list.
pub fn log_heap_dump() {
    let guard = KERNEL_HEAP.lock();
    guard
        .as_ref()
        .expect("Kernel heap does not exist.")
        .log_dump();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::FRAME_SIZE;
    use crate::memory::bitmap_frame_allocator::BitmapFrameAllocator;
    use std::alloc::{alloc_zeroed, Layout};

    const ARENA_SIZE: usize = 1024 * 1024;

    /// Frame source for tests that must not grow the heap.
    struct NoFrames;

    unsafe impl FrameAllocator<Size4KiB> for NoFrames {
        fn allocate_frame(&mut self) -> Option<x86_64::structures::paging::PhysFrame> {
            None
        }
    }

    /// Frame-aligned host buffer standing in for arena or region memory,
    /// leaked for the duration of the test process.
    fn leak_buffer(size: usize) -> usize {
        let layout = Layout::from_size_align(size, FRAME_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        base as usize
    }

    /// 1 MiB arena with growth disabled (maximum == initial).
    fn new_heap() -> KernelHeap {
        let base = leak_buffer(ARENA_SIZE);
        unsafe { KernelHeap::init(base, ARENA_SIZE, ARENA_SIZE) }
    }

    /// Walk the list and check the coverage invariants: block sizes sum to
    /// the total, in-order neighbors never overlap, and address-adjacent
    /// free blocks do not coexist.
    fn assert_coverage(heap: &KernelHeap) {
        let mut walked = 0;
        let mut previous: Option<BlockInfo> = None;
        for block in heap.blocks() {
            if let Some(prev) = previous {
                let prev_end = prev.address + prev.size;
                if block.address >= prev.address {
                    assert!(prev_end <= block.address, "blocks overlap");
                }
                if prev_end == block.address {
                    assert!(
                        prev.used || block.used,
                        "adjacent free blocks left unmerged"
                    );
                }
            }
            walked += block.size;
            previous = Some(block);
        }
        assert_eq!(walked, heap.stats().total_size, "list does not cover the arena");
    }

    fn free_block_sizes(heap: &KernelHeap) -> Vec<usize> {
        heap.blocks().filter(|b| !b.used).map(|b| b.size).collect()
    }

    #[test]
    fn header_is_alignment_friendly() {
        assert_eq!(HEADER_SIZE % HEAP_ALIGNMENT, 0);
    }

    #[test]
    fn kmalloc_zero_returns_null_without_touching_the_heap() {
        let mut heap = new_heap();
        let before = heap.stats();
        assert!(heap.kmalloc(0, &mut NoFrames).is_null());
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn kfree_null_is_a_noop() {
        let mut heap = new_heap();
        let before = heap.stats();
        unsafe { heap.kfree(ptr::null_mut()) };
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn allocations_are_aligned_and_distinct() {
        let mut heap = new_heap();
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for size in [1, 7, 8, 24, 64, 100, 512, 4000] {
            let payload = heap.kmalloc(size, &mut NoFrames);
            assert!(!payload.is_null());
            let header = payload as usize - HEADER_SIZE;
            assert_eq!(header % HEAP_ALIGNMENT, 0);
            for &(start, len) in &ranges {
                assert!(header + size <= start || start + len <= header);
            }
            ranges.push((header, size));
        }
        assert_coverage(&heap);
    }

    #[test]
    fn first_fit_reuses_freed_blocks() {
        let mut heap = new_heap();
        let a = heap.kmalloc(64, &mut NoFrames);
        let b = heap.kmalloc(128, &mut NoFrames);
        let c = heap.kmalloc(512, &mut NoFrames);
        let d = heap.kmalloc(32, &mut NoFrames);
        assert!(!a.is_null() && !b.is_null() && !c.is_null() && !d.is_null());

        unsafe {
            heap.kfree(b);
            heap.kfree(d);
        }

        // 100 bytes fit the freed 128-byte block, 24 bytes the freed
        // 32-byte block; first-fit must hand back the same addresses.
        let reused_b = heap.kmalloc(100, &mut NoFrames);
        assert_eq!(reused_b, b);
        let reused_d = heap.kmalloc(24, &mut NoFrames);
        assert_eq!(reused_d, d);
        assert_coverage(&heap);
    }

    #[test]
    fn freeing_b_a_c_leaves_one_spanning_block() {
        let mut heap = new_heap();
        let a = heap.kmalloc(64, &mut NoFrames);
        let b = heap.kmalloc(64, &mut NoFrames);
        let c = heap.kmalloc(64, &mut NoFrames);
        // Guard block so the merged span cannot swallow the arena tail.
        let guard = heap.kmalloc(64, &mut NoFrames);
        assert!(!guard.is_null());

        let block_size = heap.blocks().next().unwrap().size;

        unsafe {
            heap.kfree(b);
            heap.kfree(a);
            heap.kfree(c);
        }

        let free_sizes = free_block_sizes(&heap);
        // The A+B+C span and the untouched arena remainder.
        assert_eq!(free_sizes.len(), 2);
        assert_eq!(free_sizes[0], 3 * block_size);
        assert_eq!(heap.blocks().next().unwrap().address, a as usize - HEADER_SIZE);
        assert_coverage(&heap);
    }

    #[test]
    fn round_trip_restores_a_single_free_block() {
        let mut heap = new_heap();
        let baseline = heap.stats();
        assert_eq!(baseline.used_size, HEADER_SIZE);

        let ptrs: Vec<*mut u8> = [24usize, 100, 512, 7, 64, 129]
            .iter()
            .map(|&size| heap.kmalloc(size, &mut NoFrames))
            .collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));

        for index in [2usize, 0, 5, 1, 4, 3] {
            unsafe { heap.kfree(ptrs[index]) };
        }

        assert_eq!(heap.stats().used_size, baseline.used_size);
        assert_eq!(heap.stats().total_size, baseline.total_size);
        assert_eq!(heap.blocks().count(), 1);
        let only = heap.blocks().next().unwrap();
        assert!(!only.used);
        assert_eq!(only.size, ARENA_SIZE);
    }

    #[test]
    fn undersized_leftover_is_not_split() {
        let mut heap = new_heap();
        let a = heap.kmalloc(64, &mut NoFrames);
        let guard = heap.kmalloc(64, &mut NoFrames);
        assert!(!guard.is_null());
        let full_size = heap.blocks().next().unwrap().size;

        unsafe { heap.kfree(a) };

        // 34 bytes round up to 72 with the header; the 24-byte leftover is
        // below the split threshold, so the block keeps its full size.
        let reused = heap.kmalloc(34, &mut NoFrames);
        assert_eq!(reused, a);
        assert_eq!(heap.blocks().next().unwrap().size, full_size);
        assert_coverage(&heap);
    }

    #[test]
    fn double_free_is_reported_once() {
        let mut heap = new_heap();
        let a = heap.kmalloc(64, &mut NoFrames);
        let guard = heap.kmalloc(64, &mut NoFrames);
        assert!(!guard.is_null());

        unsafe { heap.kfree(a) };
        let after_first = heap.stats();
        unsafe { heap.kfree(a) };
        assert_eq!(heap.stats(), after_first);
        assert_coverage(&heap);
    }

    #[test]
    fn growth_extends_the_heap_once_within_the_maximum() {
        let region_frames = 64;
        let region = leak_buffer(region_frames * FRAME_SIZE);
        let mut frames = unsafe {
            BitmapFrameAllocator::init(region, region_frames * FRAME_SIZE, FRAME_SIZE)
        };
        let arena = leak_buffer(16 * FRAME_SIZE);
        let mut heap = unsafe { KernelHeap::init(arena, 16 * FRAME_SIZE, 64 * FRAME_SIZE) };

        // Larger than the whole initial arena, within the maximum.
        let request = 20 * FRAME_SIZE;
        let frames_before = frames.stats().used_frames;
        let total_before = heap.stats().total_size;

        let payload = heap.kmalloc(request, &mut frames);
        assert!(!payload.is_null());

        let pages_needed = (request + HEADER_SIZE).div_ceil(PAGE_SIZE);
        assert_eq!(
            heap.stats().total_size,
            total_before + pages_needed * PAGE_SIZE
        );
        assert_eq!(frames.stats().used_frames, frames_before + pages_needed);
        assert_coverage(&heap);

        unsafe { heap.kfree(payload) };
        assert_coverage(&heap);
    }

    #[test]
    fn growth_is_refused_beyond_the_maximum() {
        let region = leak_buffer(64 * FRAME_SIZE);
        let mut frames =
            unsafe { BitmapFrameAllocator::init(region, 64 * FRAME_SIZE, FRAME_SIZE) };
        let arena = leak_buffer(16 * FRAME_SIZE);

        // Maximum equal to the initial size: expansion refused outright.
        let mut heap = unsafe { KernelHeap::init(arena, 16 * FRAME_SIZE, 16 * FRAME_SIZE) };
        let frames_before = frames.stats();
        assert!(heap.kmalloc(17 * FRAME_SIZE, &mut frames).is_null());
        assert_eq!(heap.stats().total_size, 16 * FRAME_SIZE);
        assert_eq!(frames.stats(), frames_before);

        // One spare frame of headroom, nineteen needed: refused before any
        // frame is granted.
        let arena = leak_buffer(16 * FRAME_SIZE);
        let mut heap = unsafe {
            KernelHeap::init(arena, 16 * FRAME_SIZE, 17 * FRAME_SIZE)
        };
        assert!(heap.kmalloc(18 * FRAME_SIZE, &mut frames).is_null());
        assert_eq!(heap.stats().total_size, 16 * FRAME_SIZE);
        assert_eq!(frames.stats(), frames_before);
    }

    #[test]
    fn growth_failure_without_frames_returns_null() {
        let arena = leak_buffer(16 * FRAME_SIZE);
        let mut heap = unsafe { KernelHeap::init(arena, 16 * FRAME_SIZE, 64 * FRAME_SIZE) };
        let before = heap.stats();
        assert!(heap.kmalloc(20 * FRAME_SIZE, &mut NoFrames).is_null());
        assert_eq!(heap.stats(), before);
        assert_coverage(&heap);
    }

    #[test]
    fn used_size_tracks_full_block_sizes() {
        let mut heap = new_heap();
        let baseline = heap.stats().used_size;
        let a = heap.kmalloc(100, &mut NoFrames);
        let a_size = heap.blocks().next().unwrap().size;
        assert_eq!(heap.stats().used_size, baseline + a_size);
        unsafe { heap.kfree(a) };
        assert_eq!(heap.stats().used_size, baseline);
        assert_eq!(heap.stats().total_allocations, 1);
        assert_eq!(heap.stats().total_frees, 1);
    }
}
