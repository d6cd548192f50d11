//! # Virtual Memory Manager
//!
//! Four-level page tables reached through the physical-memory offset, an
//! identity map of physical memory, and demand-paged ranges in two bands:
//!
//! - kernel heap (`alloc_page`, `alloc_pages`, `kbrk`)
//! - kernel stacks (`alloc_kstack`)
//!
//! A reserved page is a leaf entry with [`ALLOC_ON_DEMAND`] set and
//! `PRESENT` clear. The first touch faults, [`VirtualMemory::handle_page_fault`]
//! commits a zeroed frame and the access is retried.
//!
//! ```text
//!  63      48 47    39 38    30 29    21 20    12 11       0
//! ┌──────────┬────────┬────────┬────────┬────────┬──────────┐
//! │ sign ext │  P4    │  P3    │  P2    │  P1    │  offset  │
//! └──────────┴────────┴────────┴────────┴────────┴──────────┘
//! ```

use core::cmp::Ordering;
use core::fmt;

use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use super::frame::FrameSource;
use crate::arch;
use crate::config::{
    KERNEL_HEAP_BASE, KERNEL_STACKS_BASE, KSTACK_GUARD, KSTACK_SIZE, KSTACK_TOP_SLACK, PAGE_SIZE,
    RESERVED_GROWTH_BASE, USER_SPACE_BASE,
};
use crate::fatal;
use crate::memory::allocators::common::align_up;

const PAGE: u64 = PAGE_SIZE as u64;
const KSTACK_STRIDE: u64 = (KSTACK_GUARD + KSTACK_SIZE) as u64;

/// Software bit marking a leaf entry as reserved but not yet backed.
pub const ALLOC_ON_DEMAND: PageTableFlags = PageTableFlags::BIT_9;

/// P4 slots that belong to the higher half.
const HIGHER_HALF: core::ops::Range<usize> = 256..512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfFrames,
    AddressSpaceExhausted,
    InvalidAccess(u64),
    NotMapped(u64),
    ShrinkUnsupported,
    InvalidRange,
    NotInitialized,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "out of physical frames"),
            VmError::AddressSpaceExhausted => write!(f, "virtual band exhausted"),
            VmError::InvalidAccess(addr) => write!(f, "invalid access at {:#x}", addr),
            VmError::NotMapped(addr) => write!(f, "{:#x} is not a managed page", addr),
            VmError::ShrinkUnsupported => write!(f, "the program break never moves down"),
            VmError::InvalidRange => write!(f, "invalid range"),
            VmError::NotInitialized => write!(f, "virtual memory not initialized"),
        }
    }
}

/// Location of a leaf entry: the physical leaf table and the index in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafSlot {
    pub table: PhysAddr,
    pub index: usize,
}

pub struct VirtualMemory {
    root: PhysAddr,
    phys_offset: u64,
    heap_next: u64,
    kstack_next: u64,
    faults_served: u64,
}

impl VirtualMemory {
    /// Allocates and zeroes an empty top-level table. Halts if there is no
    /// frame for it.
    pub fn new<F: FrameSource>(frames: &mut F, phys_offset: u64) -> Self {
        let root = frames
            .allocate_frame()
            .unwrap_or_else(|| fatal!("[vmm] no frame for the top-level page table"))
            .start_address();
        let vm = Self {
            root,
            phys_offset,
            heap_next: KERNEL_HEAP_BASE,
            kstack_next: KERNEL_STACKS_BASE,
            faults_served: 0,
        };
        vm.zero_frame(root);
        vm
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn phys_offset(&self) -> u64 {
        self.phys_offset
    }

    /// Current program break.
    pub fn heap_break(&self) -> VirtAddr {
        VirtAddr::new(self.heap_next)
    }

    pub fn faults_served(&self) -> u64 {
        self.faults_served
    }

    fn host_ptr(&self, phys: PhysAddr) -> *mut u8 {
        phys.as_u64().wrapping_add(self.phys_offset) as *mut u8
    }

    fn table_ptr(&self, phys: PhysAddr) -> *mut PageTable {
        self.host_ptr(phys) as *mut PageTable
    }

    fn zero_frame(&self, phys: PhysAddr) {
        unsafe { core::ptr::write_bytes(self.host_ptr(phys), 0, PAGE_SIZE) };
    }

    #[allow(clippy::mut_from_ref)]
    fn entry_at(&self, slot: LeafSlot) -> &mut PageTableEntry {
        unsafe { &mut (&mut *self.table_ptr(slot.table))[slot.index] }
    }

    /// Descends from `root` to the leaf table of `addr`, creating missing
    /// tables. Running out of frames here halts the kernel.
    pub fn walk_in<F: FrameSource>(&self, root: PhysAddr, addr: VirtAddr, frames: &mut F) -> LeafSlot {
        let mut table = root;
        for index in [addr.p4_index(), addr.p3_index(), addr.p2_index()] {
            let entry = unsafe { &mut (&mut *self.table_ptr(table))[index] };
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                let frame = frames
                    .allocate_frame()
                    .unwrap_or_else(|| fatal!("[vmm] no frame for a page table covering {:#x}", addr.as_u64()))
                    .start_address();
                self.zero_frame(frame);
                entry.set_addr(frame, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
            }
            table = entry.addr();
        }
        LeafSlot {
            table,
            index: usize::from(addr.p1_index()),
        }
    }

    pub fn walk<F: FrameSource>(&self, addr: VirtAddr, frames: &mut F) -> LeafSlot {
        self.walk_in(self.root, addr, frames)
    }

    /// Like [`walk_in`](Self::walk_in) but never creates anything.
    pub fn lookup_in(&self, root: PhysAddr, addr: VirtAddr) -> Option<LeafSlot> {
        let mut table = root;
        for index in [addr.p4_index(), addr.p3_index(), addr.p2_index()] {
            let entry = unsafe { &(&*self.table_ptr(table))[index] };
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                return None;
            }
            table = entry.addr();
        }
        Some(LeafSlot {
            table,
            index: usize::from(addr.p1_index()),
        })
    }

    pub fn lookup(&self, addr: VirtAddr) -> Option<LeafSlot> {
        self.lookup_in(self.root, addr)
    }

    pub fn entry(&self, slot: LeafSlot) -> &PageTableEntry {
        self.entry_at(slot)
    }

    pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        let slot = self.lookup(addr)?;
        let entry = self.entry_at(slot);
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(entry.addr() + u64::from(addr.page_offset()))
    }

    /// Identity-maps `[0, end)`. Virtual page zero gets a fresh frame of its
    /// own instead of physical page zero.
    pub fn identity_map<F: FrameSource>(&mut self, frames: &mut F, end: u64) {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        let end = align_up(end as usize, PAGE_SIZE) as u64;

        let mut addr = 0;
        while addr < end {
            let slot = self.walk(VirtAddr::new(addr), frames);
            let target = if addr == 0 {
                let frame = frames
                    .allocate_frame()
                    .unwrap_or_else(|| fatal!("[vmm] no frame to back page zero"))
                    .start_address();
                self.zero_frame(frame);
                frame
            } else {
                PhysAddr::new(addr)
            };
            self.entry_at(slot).set_addr(target, flags);
            addr += PAGE;
        }
    }

    /// Copies the higher-half P4 entries of `source` so whatever the boot
    /// layer mapped there (kernel image, physical-memory window, boot stack)
    /// survives the switch to our tables.
    pub fn adopt_higher_half(&mut self, source: PhysAddr) {
        let src = self.table_ptr(source);
        let dst = self.table_ptr(self.root);
        for i in HIGHER_HALF {
            unsafe { (&mut *dst)[i] = (&*src)[i].clone() };
        }
    }

    /// Loads our top-level table into CR3.
    ///
    /// # Safety
    /// Everything the kernel runs on must be mapped by this table.
    pub unsafe fn activate(&self) {
        arch::set_page_table_base(self.root);
    }

    fn reserve<F: FrameSource>(&mut self, addr: VirtAddr, frames: &mut F) {
        let slot = self.walk(addr, frames);
        let entry = self.entry_at(slot);
        entry.set_addr(PhysAddr::new(0), ALLOC_ON_DEMAND | PageTableFlags::WRITABLE);
    }

    pub fn alloc_page<F: FrameSource>(&mut self, frames: &mut F) -> Result<VirtAddr, VmError> {
        self.alloc_pages(1, frames)
    }

    /// Reserves `count` consecutive heap pages and returns the first one.
    pub fn alloc_pages<F: FrameSource>(&mut self, count: usize, frames: &mut F) -> Result<VirtAddr, VmError> {
        if count == 0 {
            return Err(VmError::InvalidRange);
        }
        let len = (count as u64).checked_mul(PAGE).ok_or(VmError::AddressSpaceExhausted)?;
        let start = self.heap_next;
        if start.checked_add(len).map_or(true, |end| end > USER_SPACE_BASE) {
            return Err(VmError::AddressSpaceExhausted);
        }
        self.heap_next = start + len;

        for i in 0..count as u64 {
            self.reserve(VirtAddr::new(start + i * PAGE), frames);
        }
        Ok(VirtAddr::new(start))
    }

    /// Releases a demand-managed page and its backing frame, if any.
    pub fn free_page<F: FrameSource>(&mut self, ptr: VirtAddr, frames: &mut F) -> Result<(), VmError> {
        let page = ptr.align_down(PAGE);
        let slot = self.lookup(page).ok_or(VmError::NotMapped(page.as_u64()))?;
        let entry = self.entry_at(slot);
        let flags = entry.flags();
        if !flags.contains(ALLOC_ON_DEMAND) {
            return Err(VmError::NotMapped(page.as_u64()));
        }
        if flags.contains(PageTableFlags::PRESENT) {
            let frame = PhysFrame::containing_address(entry.addr());
            entry.set_unused();
            arch::flush_tlb(page);
            unsafe { frames.deallocate_frame(frame) };
        } else {
            entry.set_unused();
        }
        Ok(())
    }

    pub fn free_pages<F: FrameSource>(&mut self, ptr: VirtAddr, count: usize, frames: &mut F) -> Result<(), VmError> {
        let start = ptr.align_down(PAGE);
        for i in 0..count as u64 {
            self.free_page(start + i * PAGE, frames)?;
        }
        Ok(())
    }

    /// Gives the backing frames of `count` pages back while keeping the pages
    /// reserved: the next touch faults in a zeroed frame.
    pub fn decommit_pages<F: FrameSource>(&mut self, ptr: VirtAddr, count: usize, frames: &mut F) -> usize {
        let start = ptr.align_down(PAGE);
        let mut released = 0;
        for i in 0..count as u64 {
            let page = start + i * PAGE;
            let Some(slot) = self.lookup(page) else { continue };
            let entry = self.entry_at(slot);
            let flags = entry.flags();
            if flags.contains(ALLOC_ON_DEMAND | PageTableFlags::PRESENT) {
                let frame = PhysFrame::containing_address(entry.addr());
                entry.set_addr(PhysAddr::new(0), ALLOC_ON_DEMAND | PageTableFlags::WRITABLE);
                arch::flush_tlb(page);
                unsafe { frames.deallocate_frame(frame) };
                released += 1;
            }
        }
        released
    }

    fn commit<F: FrameSource>(&mut self, slot: LeafSlot, addr: VirtAddr, frames: &mut F) -> Result<(), VmError> {
        let frame = frames.allocate_frame().ok_or(VmError::OutOfFrames)?.start_address();
        self.zero_frame(frame);
        let entry = self.entry_at(slot);
        let flags = entry.flags() | PageTableFlags::PRESENT;
        entry.set_addr(frame, flags);
        arch::flush_tlb(addr.align_down(PAGE));
        Ok(())
    }

    /// Commits every still-reserved page of `[ptr, ptr + count pages)` now
    /// instead of on first touch. Returns how many pages needed a frame.
    pub fn populate<F: FrameSource>(&mut self, ptr: VirtAddr, count: usize, frames: &mut F) -> Result<usize, VmError> {
        let start = ptr.align_down(PAGE);
        let mut committed = 0;
        for i in 0..count as u64 {
            let page = start + i * PAGE;
            let slot = self.lookup(page).ok_or(VmError::NotMapped(page.as_u64()))?;
            let flags = self.entry_at(slot).flags();
            if !flags.contains(ALLOC_ON_DEMAND) {
                return Err(VmError::NotMapped(page.as_u64()));
            }
            if !flags.contains(PageTableFlags::PRESENT) {
                self.commit(slot, page, frames)?;
                committed += 1;
            }
        }
        Ok(committed)
    }

    /// Backs a reserved page that was just touched.
    ///
    /// `Err` means the access was not to a reserved page; the caller decides
    /// how fatal that is.
    pub fn handle_page_fault<F: FrameSource>(
        &mut self,
        root: PhysAddr,
        addr: VirtAddr,
        frames: &mut F,
    ) -> Result<(), VmError> {
        let slot = self
            .lookup_in(root, addr)
            .ok_or(VmError::InvalidAccess(addr.as_u64()))?;
        let flags = self.entry_at(slot).flags();
        if !flags.contains(ALLOC_ON_DEMAND) || flags.contains(PageTableFlags::PRESENT) {
            return Err(VmError::InvalidAccess(addr.as_u64()));
        }
        self.commit(slot, addr, frames)?;
        self.faults_served += 1;
        Ok(())
    }

    /// Reserves a kernel stack below an unmapped guard page and returns its
    /// initial top.
    pub fn alloc_kstack<F: FrameSource>(&mut self, frames: &mut F) -> Result<VirtAddr, VmError> {
        let start = self.kstack_next + KSTACK_GUARD as u64;
        let end = start + KSTACK_SIZE as u64;
        if end > RESERVED_GROWTH_BASE {
            return Err(VmError::AddressSpaceExhausted);
        }
        self.kstack_next = end;

        let mut page = start;
        while page < end {
            self.reserve(VirtAddr::new(page), frames);
            page += PAGE;
        }
        Ok(VirtAddr::new(end - KSTACK_TOP_SLACK as u64))
    }

    /// A kernel stack for a thread: reserved like [`alloc_kstack`](Self::alloc_kstack)
    /// and then committed in full. Threads call into the VMM and the frame
    /// allocator with their locks held, so their stacks must never fault.
    pub fn alloc_thread_stack<F: FrameSource>(&mut self, frames: &mut F) -> Result<VirtAddr, VmError> {
        let top = self.alloc_kstack(frames)?;
        let bottom = top + KSTACK_TOP_SLACK as u64 - KSTACK_SIZE as u64;
        if let Err(err) = self.populate(bottom, KSTACK_SIZE / PAGE_SIZE, frames) {
            self.free_kstack(top, frames)?;
            return Err(err);
        }
        Ok(top)
    }

    /// Releases the stack containing `ptr` (any address inside it works).
    pub fn free_kstack<F: FrameSource>(&mut self, ptr: VirtAddr, frames: &mut F) -> Result<(), VmError> {
        let addr = ptr.as_u64();
        if addr < KERNEL_STACKS_BASE || addr >= self.kstack_next {
            return Err(VmError::InvalidRange);
        }
        let slot_start = KERNEL_STACKS_BASE + (addr - KERNEL_STACKS_BASE) / KSTACK_STRIDE * KSTACK_STRIDE;
        let start = slot_start + KSTACK_GUARD as u64;
        if addr < start {
            return Err(VmError::InvalidRange);
        }
        self.free_pages(VirtAddr::new(start), KSTACK_SIZE / PAGE_SIZE, frames)
    }

    /// Program break: 0 reads it, a positive increment grows it by whole
    /// pages and returns the old break, a negative one is refused.
    pub fn kbrk<F: FrameSource>(&mut self, increment: isize, frames: &mut F) -> Result<VirtAddr, VmError> {
        match increment.cmp(&0) {
            Ordering::Equal => Ok(self.heap_break()),
            Ordering::Less => Err(VmError::ShrinkUnsupported),
            Ordering::Greater => {
                let pages = align_up(increment as usize, PAGE_SIZE) / PAGE_SIZE;
                self.alloc_pages(pages, frames)
            }
        }
    }

    fn resolve<F: FrameSource>(&mut self, addr: VirtAddr, frames: &mut F) -> Result<*mut u64, VmError> {
        if addr.as_u64() % 8 != 0 {
            return Err(VmError::InvalidRange);
        }
        let slot = self.lookup(addr).ok_or(VmError::NotMapped(addr.as_u64()))?;
        let flags = self.entry_at(slot).flags();
        if !flags.contains(PageTableFlags::PRESENT) {
            if !flags.contains(ALLOC_ON_DEMAND) {
                return Err(VmError::NotMapped(addr.as_u64()));
            }
            self.commit(slot, addr, frames)?;
        }
        let phys = self.entry_at(slot).addr() + u64::from(addr.page_offset());
        Ok(self.host_ptr(phys) as *mut u64)
    }

    /// Writes through the physical mapping, committing the page first if it
    /// is only reserved. Never faults.
    pub fn write_u64<F: FrameSource>(&mut self, addr: VirtAddr, value: u64, frames: &mut F) -> Result<(), VmError> {
        let ptr = self.resolve(addr, frames)?;
        unsafe { ptr.write_volatile(value) };
        Ok(())
    }

    pub fn read_u64<F: FrameSource>(&mut self, addr: VirtAddr, frames: &mut F) -> Result<u64, VmError> {
        let ptr = self.resolve(addr, frames)?;
        Ok(unsafe { ptr.read_volatile() })
    }
}
