//! # Kernel heap
//!
//! `kmalloc`/`kfree`/`kcalloc`/`krealloc` over a first-fit [`Heap`] whose
//! memory comes from the VMM program break. The same heap backs `alloc`
//! through [`LockedHeap`].

pub mod common;
pub mod kmalloc;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

pub use kmalloc::{BlockInfo, Heap, HeapStats, ProgramBreak, HEADER_SIZE};

use crate::config::HEAP_ALIGNMENT;
use crate::sync::{IrqMutex, IrqMutexGuard};
use common::align_up;

pub struct LockedHeap<B> {
    inner: IrqMutex<Heap<B>>,
}

impl<B: ProgramBreak> LockedHeap<B> {
    pub const fn new(brk: B) -> Self {
        Self {
            inner: IrqMutex::new(Heap::new(brk)),
        }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, Heap<B>> {
        self.inner.lock()
    }
}

unsafe impl<B: ProgramBreak + Send> GlobalAlloc for LockedHeap<B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        if layout.align() <= HEAP_ALIGNMENT {
            return self.lock().kmalloc(size);
        }
        // Over-allocate and hand out an interior pointer; `free` accepts
        // any address inside a block.
        let Some(padded) = size.checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        let raw = self.lock().kmalloc(padded);
        if raw.is_null() {
            return raw;
        }
        align_up(raw as usize, layout.align()) as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.lock().free(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= HEAP_ALIGNMENT {
            return self.lock().calloc(1, layout.size().max(1));
        }
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= HEAP_ALIGNMENT {
            return self.lock().realloc(ptr, new_size.max(1));
        }
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let moved = self.alloc(new_layout);
        if !moved.is_null() {
            ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        moved
    }
}

/// Break backed by the kernel VMM heap band.
pub struct KernelBreak;

impl ProgramBreak for KernelBreak {
    fn kbrk(&mut self, increment: isize) -> Option<usize> {
        crate::memory::kbrk(increment)
            .map(|addr| addr.as_u64() as usize)
            .ok()
    }

    fn release(&mut self, start: usize, len: usize) {
        crate::memory::decommit(start, len);
    }
}

#[cfg_attr(not(test), global_allocator)]
pub static HEAP: LockedHeap<KernelBreak> = LockedHeap::new(KernelBreak);

pub fn kmalloc(size: usize) -> *mut u8 {
    HEAP.lock().kmalloc(size)
}

pub fn kfree(ptr: *mut u8) {
    HEAP.lock().free(ptr)
}

pub fn kcalloc(n: usize, size: usize) -> *mut u8 {
    HEAP.lock().calloc(n, size)
}

pub fn krealloc(ptr: *mut u8, size: usize) -> *mut u8 {
    HEAP.lock().realloc(ptr, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HEAP_BLOCK_SIZE, PAGE_SIZE};

    /// Leaked host pages; enough for a handful of regions.
    struct LeakedBreak {
        next: usize,
        end: usize,
    }

    impl LeakedBreak {
        fn new(regions: usize) -> Self {
            let len = regions * HEAP_BLOCK_SIZE;
            let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
            let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
            assert_ne!(base, 0);
            Self { next: base, end: base + len }
        }
    }

    impl ProgramBreak for LeakedBreak {
        fn kbrk(&mut self, increment: isize) -> Option<usize> {
            let grow = align_up(increment as usize, PAGE_SIZE);
            if self.next + grow > self.end {
                return None;
            }
            let old = self.next;
            self.next += grow;
            Some(old)
        }

        fn release(&mut self, _start: usize, _len: usize) {}
    }

    #[test]
    fn test_global_alloc_honours_large_alignment() {
        let heap = LockedHeap::new(LeakedBreak::new(4));
        let layout = Layout::from_size_align(100, 256).unwrap();
        unsafe {
            let p = heap.alloc(layout);
            assert_eq!(p as usize % 256, 0);
            ptr::write_bytes(p, 0xAB, 100);
            heap.dealloc(p, layout);
        }
        assert!(heap.lock().blocks().next().unwrap().free);
    }

    #[test]
    fn test_global_realloc_keeps_contents() {
        let heap = LockedHeap::new(LeakedBreak::new(4));
        let layout = Layout::from_size_align(32, 8).unwrap();
        unsafe {
            let p = heap.alloc_zeroed(layout);
            assert!(core::slice::from_raw_parts(p, 32).iter().all(|&b| b == 0));
            for i in 0..32 {
                *p.add(i) = i as u8;
            }
            let q = heap.realloc(p, layout, 4096);
            for i in 0..32 {
                assert_eq!(*q.add(i), i as u8);
            }
            heap.dealloc(q, Layout::from_size_align(4096, 8).unwrap());
        }
    }
}
