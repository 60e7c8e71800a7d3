//! Language items for bare-metal builds.
//!
//! Hosted builds (including unit tests) use the host's allocator and panic
//! machinery, so everything here is compiled only for `target_os = "none"`.

#[cfg(target_os = "none")]
mod bare {
    use crate::mm::ContigPages;
    use core::alloc::{GlobalAlloc, Layout};

    // Heap allocations are served straight from the buddy allocator. The
    // smallest buddy block is a page, so sub-page allocations round up;
    // kernel heap objects are rare enough that this is acceptable for a
    // teaching kernel.
    struct BuddyHeap;

    unsafe impl GlobalAlloc for BuddyHeap {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let size = layout.size().max(layout.align());
            match ContigPages::new_with_align(size, layout.align()) {
                Some(pages) => pages.into_raw().into_kva().into_usize() as *mut u8,
                None => core::ptr::null_mut(),
            }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            let size = layout.size().max(layout.align());
            unsafe {
                drop(ContigPages::from_raw(
                    roost::addressing::Kva::new(ptr as usize).unwrap().into_pa(),
                    size,
                ));
            }
        }
    }

    #[global_allocator]
    static HEAP: BuddyHeap = BuddyHeap;

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        let _guard = core::mem::ManuallyDrop::new(roost::interrupt::InterruptGuard::new());
        println!("*** KERNEL PANIC ***");
        println!("{}", info);
        loop {
            roost::x86_64::pause();
        }
    }
}
