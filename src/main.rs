#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use ferrum::memory::{self, frame_allocator, heap};
    use limine::request::{RequestsEndMarker, RequestsStartMarker};
    use limine::BaseRevision;
    use log::{error, info};

    #[used]
    #[link_section = ".requests"]
    static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    #[link_section = ".requests_start_marker"]
    static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

    #[used]
    #[link_section = ".requests_end_marker"]
    static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        assert!(BASE_REVISION.is_supported());

        ferrum::logging::init();
        info!("Booting...");

        memory::init();

        frame_demo();
        heap_demo();

        info!("Kernel initialized successfully");
        ferrum::idle_loop();
    }

    /// Allocate a handful of frames, free the middle ones, and show the
    /// accounting after each step.
    fn frame_demo() {
        info!("=== Frame Allocator Test ===");
        frame_allocator::log_frame_stats();

        let mut frames = [None; 5];
        for (i, slot) in frames.iter_mut().enumerate() {
            *slot = frame_allocator::alloc_frame();
            if let Some(frame) = slot {
                info!(
                    "  Allocated frame {}: {:#x}",
                    i,
                    frame.start_address().as_u64()
                );
            }
        }

        info!("After allocation:");
        frame_allocator::log_frame_stats();

        for slot in frames.iter_mut().take(4).skip(1) {
            if let Some(frame) = slot.take() {
                frame_allocator::dealloc_frame(frame);
                info!("  Freed frame: {:#x}", frame.start_address().as_u64());
            }
        }

        info!("After freeing:");
        frame_allocator::log_frame_stats();

        // Return the rest so the heap can grow over a contiguous run later.
        for slot in frames.iter_mut() {
            if let Some(frame) = slot.take() {
                frame_allocator::dealloc_frame(frame);
            }
        }
    }

    /// Walk the heap through its paces: basic allocation, free-and-reuse,
    /// boundary cases, and an allocation large enough to grow the arena.
    fn heap_demo() {
        info!("=== Heap Allocator Test ===");
        heap::log_heap_stats();

        let a = heap::kmalloc(64);
        let b = heap::kmalloc(128);
        let c = heap::kmalloc(512);
        let d = heap::kmalloc(32);
        if a.is_null() || b.is_null() || c.is_null() || d.is_null() {
            error!("Basic allocation failed");
            return;
        }
        info!(
            "  Allocated: 64B@{:#x}, 128B@{:#x}, 512B@{:#x}, 32B@{:#x}",
            a as usize, b as usize, c as usize, d as usize
        );
        heap::log_heap_dump();

        unsafe {
            heap::kfree(b);
            heap::kfree(d);
        }
        let reused_b = heap::kmalloc(100);
        let reused_d = heap::kmalloc(24);
        info!(
            "  Reallocated: 100B@{:#x}, 24B@{:#x}",
            reused_b as usize, reused_d as usize
        );

        let zero = heap::kmalloc(0);
        info!("  kmalloc(0) = {:#x}", zero as usize);
        unsafe { heap::kfree(core::ptr::null_mut()) };

        info!("  Triggering heap expansion...");
        let large = heap::kmalloc(2 * 1024 * 1024);
        if large.is_null() {
            error!("Large allocation failed");
        } else {
            info!("  Large allocation at {:#x}", large as usize);
            unsafe { heap::kfree(large) };
        }

        unsafe {
            heap::kfree(reused_b);
            heap::kfree(reused_d);
            heap::kfree(c);
            heap::kfree(a);
        }

        heap::log_heap_stats();
        heap::log_heap_dump();
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        error!("Kernel panic: {}", info);
        ferrum::idle_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
