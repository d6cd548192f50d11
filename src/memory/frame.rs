//! # Physical Page-Frame Allocator
//!
//! Two sources, tried in this order:
//!
//! | Source    | Shape                                             |
//! |-----------|---------------------------------------------------|
//! | Free list | LIFO stack threaded through the released frames   |
//! | Bump      | untracked regions carved front to back, page-wise |
//!
//! The bump phase walks the low region first and then the high region.
//! Frames are only ever touched through the physical-memory offset, so the
//! free-list links live in memory that is always mapped.

use core::fmt;

use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::boot::MemoryInfo;
use crate::config::PAGE_SIZE;
use crate::memory::allocators::common::{align_down, align_up};

const PAGE: u64 = PAGE_SIZE as u64;

/// Bump regions the allocator can hold (low, high).
pub const MAX_REGIONS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhysRegion {
    pub start: u64,
    pub size: u64,
}

impl PhysRegion {
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    pub const fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Largest page-aligned region inside `self`.
    pub fn page_aligned(&self) -> Self {
        let start = align_up(self.start as usize, PAGE_SIZE) as u64;
        let end = align_down(self.end() as usize, PAGE_SIZE) as u64;
        if end <= start {
            Self::new(start, 0)
        } else {
            Self::new(start, end - start)
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    Null,
    Misaligned(u64),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Null => write!(f, "null frame address"),
            FrameError::Misaligned(addr) => write!(f, "frame {:#x} is not page aligned", addr),
        }
    }
}

/// Released frames. The first word of every listed frame holds the physical
/// address of the next one; 0 terminates (frame 0 is never handed out).
struct FreeFrameList {
    head: u64,
    len: usize,
}

impl FreeFrameList {
    const fn new() -> Self {
        Self { head: 0, len: 0 }
    }

    /// # Safety
    /// `frame` must be an unreferenced page, writable at `frame + phys_offset`.
    unsafe fn push(&mut self, frame: u64, phys_offset: u64) {
        let link = frame.wrapping_add(phys_offset) as *mut u64;
        link.write_volatile(self.head);
        self.head = frame;
        self.len += 1;
    }

    /// # Safety
    /// Every listed frame must still be readable through `phys_offset`.
    unsafe fn pop(&mut self, phys_offset: u64) -> Option<u64> {
        if self.head == 0 {
            return None;
        }
        let frame = self.head;
        let link = frame.wrapping_add(phys_offset) as *const u64;
        self.head = link.read_volatile();
        self.len -= 1;
        Some(frame)
    }
}

pub struct PageFrameAllocator {
    phys_offset: u64,
    regions: [PhysRegion; MAX_REGIONS],
    region_count: usize,
    next_region: usize,
    cursor: u64,
    remaining: u64,
    free_list: FreeFrameList,
    allocated: usize,
}

impl PageFrameAllocator {
    /// An allocator with nothing to hand out.
    pub const fn empty() -> Self {
        Self {
            phys_offset: 0,
            regions: [PhysRegion::new(0, 0); MAX_REGIONS],
            region_count: 0,
            next_region: 0,
            cursor: 0,
            remaining: 0,
            free_list: FreeFrameList::new(),
            allocated: 0,
        }
    }

    /// `phys_offset` is added to a physical address to reach it from the kernel.
    pub const fn new(phys_offset: u64) -> Self {
        let mut allocator = Self::empty();
        allocator.phys_offset = phys_offset;
        allocator
    }

    /// Queues a bump region. Returns `false` when all slots are taken or the
    /// region holds no whole page.
    pub fn add_region(&mut self, region: PhysRegion) -> bool {
        let region = region.page_aligned();
        if region.size == 0 || self.region_count == MAX_REGIONS {
            return false;
        }
        self.regions[self.region_count] = region;
        self.region_count += 1;
        true
    }

    /// Low region first (its first page is skipped so address 0 stays the
    /// null frame), then the high region with the kernel image cut out.
    pub fn from_memory_info(info: &MemoryInfo, phys_offset: u64) -> Self {
        let mut allocator = Self::new(phys_offset);

        let low = info.low.page_aligned();
        if low.size > PAGE {
            allocator.add_region(PhysRegion::new(low.start + PAGE, low.size - PAGE));
        }

        let mut high = info.high;
        let kernel = info.kernel;
        if kernel.size != 0 && kernel.start < high.end() && high.start < kernel.end() {
            if kernel.start <= high.start + PAGE {
                let start = align_up(kernel.end() as usize, PAGE_SIZE) as u64;
                high = PhysRegion::new(start, high.end().saturating_sub(start));
            } else {
                high = PhysRegion::new(high.start, kernel.start - high.start);
            }
        }
        allocator.add_region(high);

        allocator
    }

    pub fn phys_offset(&self) -> u64 {
        self.phys_offset
    }

    fn advance_region(&mut self) -> bool {
        if self.next_region == self.region_count {
            return false;
        }
        let region = self.regions[self.next_region];
        self.next_region += 1;
        self.cursor = region.start;
        self.remaining = region.size;
        true
    }

    /// Hands out one page-aligned frame, or `None` once every source is dry.
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        if let Some(frame) = unsafe { self.free_list.pop(self.phys_offset) } {
            self.allocated += 1;
            return Some(PhysAddr::new(frame));
        }

        loop {
            if self.remaining >= PAGE {
                let frame = self.cursor;
                self.cursor += PAGE;
                self.remaining -= PAGE;
                self.allocated += 1;
                return Some(PhysAddr::new(frame));
            }
            if !self.advance_region() {
                return None;
            }
        }
    }

    /// Pushes `addr` onto the free list.
    ///
    /// Freeing the same frame twice corrupts the list; callers own that.
    pub fn free(&mut self, addr: PhysAddr) -> Result<(), FrameError> {
        let raw = addr.as_u64();
        if raw == 0 {
            return Err(FrameError::Null);
        }
        if raw % PAGE != 0 {
            return Err(FrameError::Misaligned(raw));
        }
        unsafe { self.free_list.push(raw, self.phys_offset) };
        self.allocated = self.allocated.saturating_sub(1);
        Ok(())
    }

    /// Frames still obtainable.
    pub fn free_frames(&self) -> usize {
        let pending: u64 = self.regions[self.next_region..self.region_count]
            .iter()
            .map(|r| r.size / PAGE)
            .sum();
        (self.remaining / PAGE + pending) as usize + self.free_list.len
    }

    pub fn allocated_frames(&self) -> usize {
        self.allocated
    }
}

unsafe impl FrameAllocator<Size4KiB> for PageFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.alloc().map(PhysFrame::containing_address)
    }
}

impl FrameDeallocator<Size4KiB> for PageFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        if let Err(e) = self.free(frame.start_address()) {
            crate::serial_println!("[frames] rejected free: {}", e);
        }
    }
}

/// What the VMM needs from a frame source.
pub trait FrameSource: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB> {}

impl<T: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>> FrameSource for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::PhysArena;

    #[test]
    fn test_sixteen_page_pool() {
        let arena = PhysArena::new(16);
        let mut frames = arena.frames();

        let mut seen = Vec::new();
        for _ in 0..16 {
            let frame = frames.alloc().expect("pool has 16 pages");
            assert_eq!(frame.as_u64() % PAGE, 0);
            assert!(!seen.contains(&frame));
            seen.push(frame);
        }
        assert_eq!(frames.alloc(), None);
        assert_eq!(frames.alloc(), None);

        let mid = seen[7];
        frames.free(mid).unwrap();
        assert_eq!(frames.alloc(), Some(mid));
        assert_eq!(frames.alloc(), None);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let arena = PhysArena::new(8);
        let mut frames = arena.frames();
        let a = frames.alloc().unwrap();
        let b = frames.alloc().unwrap();
        let c = frames.alloc().unwrap();

        frames.free(a).unwrap();
        frames.free(c).unwrap();
        frames.free(b).unwrap();

        assert_eq!(frames.alloc(), Some(b));
        assert_eq!(frames.alloc(), Some(c));
        assert_eq!(frames.alloc(), Some(a));
    }

    #[test]
    fn test_freed_frame_preferred_over_bump() {
        let arena = PhysArena::new(8);
        let mut frames = arena.frames();
        let first = frames.alloc().unwrap();
        frames.free(first).unwrap();
        assert_eq!(frames.alloc(), Some(first));
        assert_eq!(frames.alloc(), Some(first + PAGE));
    }

    #[test]
    fn test_free_rejects_null_and_misaligned() {
        let arena = PhysArena::new(2);
        let mut frames = arena.frames();
        let before = frames.free_frames();
        assert_eq!(frames.free(PhysAddr::new(0)), Err(FrameError::Null));
        assert_eq!(
            frames.free(PhysAddr::new(arena.base() + 8)),
            Err(FrameError::Misaligned(arena.base() + 8))
        );
        assert_eq!(frames.free_frames(), before);
    }

    #[test]
    fn test_accounting() {
        let arena = PhysArena::new(4);
        let mut frames = arena.frames();
        assert_eq!(frames.free_frames(), 4);
        let a = frames.alloc().unwrap();
        frames.alloc().unwrap();
        assert_eq!(frames.free_frames(), 2);
        assert_eq!(frames.allocated_frames(), 2);
        frames.free(a).unwrap();
        assert_eq!(frames.free_frames(), 3);
        assert_eq!(frames.allocated_frames(), 1);
    }

    #[test]
    fn test_low_region_skips_page_zero_then_moves_high() {
        let info = MemoryInfo {
            low: PhysRegion::new(0, 3 * PAGE),
            high: PhysRegion::new(0x10_0000, 2 * PAGE),
            kernel: PhysRegion::default(),
        };
        let mut frames = PageFrameAllocator::from_memory_info(&info, 0);
        assert_eq!(frames.free_frames(), 4);
        assert_eq!(frames.alloc(), Some(PhysAddr::new(PAGE)));
        assert_eq!(frames.alloc(), Some(PhysAddr::new(2 * PAGE)));
        assert_eq!(frames.alloc(), Some(PhysAddr::new(0x10_0000)));
        assert_eq!(frames.alloc(), Some(PhysAddr::new(0x10_1000)));
        assert_eq!(frames.alloc(), None);
    }

    #[test]
    fn test_kernel_image_at_start_of_high_region_is_skipped() {
        let info = MemoryInfo {
            low: PhysRegion::default(),
            high: PhysRegion::new(0x10_0000, 0x10_0000),
            kernel: PhysRegion::new(0x10_0000, 0x2_0800),
        };
        let mut frames = PageFrameAllocator::from_memory_info(&info, 0);
        assert_eq!(frames.alloc(), Some(PhysAddr::new(0x12_1000)));
    }

    #[test]
    fn test_kernel_image_inside_high_region_truncates_it() {
        let info = MemoryInfo {
            low: PhysRegion::default(),
            high: PhysRegion::new(0x10_0000, 0x10_0000),
            kernel: PhysRegion::new(0x10_4000, 0x1000),
        };
        let frames = PageFrameAllocator::from_memory_info(&info, 0);
        assert_eq!(frames.free_frames(), 4);
    }

    #[test]
    fn test_unaligned_region_is_trimmed() {
        let mut frames = PageFrameAllocator::new(0);
        assert!(frames.add_region(PhysRegion::new(0x1_0800, 2 * PAGE)));
        assert_eq!(frames.free_frames(), 1);
        assert_eq!(frames.alloc(), Some(PhysAddr::new(0x1_1000)));
        assert!(!frames.add_region(PhysRegion::new(0x2_0000, 0x800)));
    }
}
