//! Host-backed "physical memory" for unit tests.
//!
//! A page-aligned heap buffer stands in for RAM. Physical addresses start at
//! [`ARENA_BASE`] and reach the buffer through `phys_offset`, the same way
//! the kernel reaches frames through the bootloader's physical mapping.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::{Mutex, MutexGuard};

use x86_64::PhysAddr;

use super::frame::{PageFrameAllocator, PhysRegion};
use super::paging::VirtualMemory;
use super::{FRAMES, VMM};
use crate::config::PAGE_SIZE;

// The kernel globals are process-wide; tests that touch them take turns.
static GLOBALS: Mutex<()> = Mutex::new(());

pub fn lock_globals() -> MutexGuard<'static, ()> {
    GLOBALS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Installs a fresh VMM over a leaked arena of `pages` frames as the global
/// one. Hold the returned guard for as long as the globals are in use.
pub fn install(pages: usize) -> (MutexGuard<'static, ()>, &'static PhysArena) {
    let guard = lock_globals();
    let arena: &'static PhysArena = Box::leak(Box::new(PhysArena::new(pages)));
    let mut frames = arena.frames();
    let vm = VirtualMemory::new(&mut frames, arena.phys_offset());
    unsafe { vm.activate() };
    *FRAMES.lock() = frames;
    *VMM.lock() = Some(vm);
    (guard, arena)
}

pub fn teardown() {
    *VMM.lock() = None;
    *FRAMES.lock() = PageFrameAllocator::empty();
}

/// Physical address of the first arena page.
pub const ARENA_BASE: u64 = 0x10_0000;

pub struct PhysArena {
    buf: *mut u8,
    layout: Layout,
    pages: usize,
}

impl PhysArena {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let buf = unsafe { alloc_zeroed(layout) };
        assert!(!buf.is_null());
        Self { buf, layout, pages }
    }

    pub fn base(&self) -> u64 {
        ARENA_BASE
    }

    pub fn phys_offset(&self) -> u64 {
        (self.buf as u64).wrapping_sub(ARENA_BASE)
    }

    pub fn region(&self) -> PhysRegion {
        PhysRegion::new(ARENA_BASE, (self.pages * PAGE_SIZE) as u64)
    }

    /// A frame allocator owning the whole arena.
    pub fn frames(&self) -> PageFrameAllocator {
        let mut frames = PageFrameAllocator::new(self.phys_offset());
        assert!(frames.add_region(self.region()));
        frames
    }

    fn host(&self, phys: PhysAddr, len: usize) -> *mut u8 {
        let start = phys.as_u64();
        assert!(start >= ARENA_BASE);
        assert!(start + len as u64 <= ARENA_BASE + (self.pages * PAGE_SIZE) as u64);
        unsafe { self.buf.add((start - ARENA_BASE) as usize) }
    }

    pub fn read_u64(&self, phys: PhysAddr) -> u64 {
        unsafe { (self.host(phys, 8) as *const u64).read() }
    }

    pub fn bytes(&self, phys: PhysAddr, len: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.host(phys, len), len) }
    }

    pub fn fill(&self, phys: PhysAddr, len: usize, byte: u8) {
        unsafe { core::ptr::write_bytes(self.host(phys, len), byte, len) }
    }
}

impl Drop for PhysArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.buf, self.layout) }
    }
}
