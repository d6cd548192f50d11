//! # Memory management
//!
//! Kernel-wide owners of physical frames, the address space and the heap:
//!
//! | Global               | Lock order | Contents                         |
//! |----------------------|------------|----------------------------------|
//! | `allocators::HEAP`   | 1          | first-fit kmalloc heap           |
//! | [`VMM`]              | 2          | kernel page tables, band cursors |
//! | [`FRAMES`]           | 3          | physical frame allocator         |
//!
//! Locks are always taken in that order. The page-fault handler runs with
//! whatever the faulting code held, so it only ever `try_lock`s the VMM.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{PhysAddr, VirtAddr};

pub mod allocators;
pub mod frame;
pub mod paging;
#[cfg(test)]
pub mod test_support;

pub use allocators::{kcalloc, kfree, kmalloc, krealloc};
pub use frame::{FrameError, PageFrameAllocator, PhysRegion};
pub use paging::{VirtualMemory, VmError, ALLOC_ON_DEMAND};

use crate::arch::{self, TrapFrame};
use crate::boot::MemoryInfo;
use crate::config::{PAGE_FAULT_VECTOR, PAGE_SIZE};
use crate::fatal;
use crate::sync::IrqMutex;

/// Source of kernel thread stacks.
pub trait StackSource {
    /// Allocates a fresh stack and returns its initial top.
    fn alloc_stack(&mut self) -> Result<VirtAddr, VmError>;

    /// Releases the stack containing `ptr`.
    fn free_stack(&mut self, ptr: VirtAddr) -> Result<(), VmError>;

    /// Stores a word on a (possibly not yet committed) stack page.
    fn write_u64(&mut self, addr: VirtAddr, value: u64) -> Result<(), VmError>;
}

pub static FRAMES: IrqMutex<PageFrameAllocator> = IrqMutex::new(PageFrameAllocator::empty());
pub static VMM: IrqMutex<Option<VirtualMemory>> = IrqMutex::new(None);

static PAGE_FAULTS: AtomicU64 = AtomicU64::new(0);

pub fn init_frames(info: &MemoryInfo, phys_offset: u64) {
    let frames = PageFrameAllocator::from_memory_info(info, phys_offset);
    crate::serial_println!(
        "[frames] {} frames free, physical memory ends at {:#x}",
        frames.free_frames(),
        info.physical_end()
    );
    *FRAMES.lock() = frames;
}

/// Builds the kernel address space, installs the fault handler and
/// switches CR3 to it.
pub fn init_paging(info: &MemoryInfo) -> Result<(), &'static str> {
    let mut vm = {
        let mut frames = FRAMES.lock();
        let phys_offset = frames.phys_offset();
        let mut vm = VirtualMemory::new(&mut *frames, phys_offset);
        vm.identity_map(&mut *frames, info.physical_end());
        vm
    };
    vm.adopt_higher_half(arch::page_table_base());

    crate::interrupts::set_handler(PAGE_FAULT_VECTOR as usize, page_fault_handler, 0)
        .map_err(|_| "page fault vector rejected")?;

    unsafe { vm.activate() };
    crate::serial_println!("[vmm] paging active, root {:#x}", vm.root().as_u64());
    *VMM.lock() = Some(vm);
    Ok(())
}

/// Runs `f` against the live VMM and the frame allocator.
pub fn with_vmm<R>(
    f: impl FnOnce(&mut VirtualMemory, &mut PageFrameAllocator) -> Result<R, VmError>,
) -> Result<R, VmError> {
    let mut vmm = VMM.lock();
    let vm = vmm.as_mut().ok_or(VmError::NotInitialized)?;
    let mut frames = FRAMES.lock();
    f(vm, &mut frames)
}

pub fn alloc_frame() -> Option<PhysAddr> {
    FRAMES.lock().alloc()
}

pub fn free_frame(addr: PhysAddr) -> Result<(), FrameError> {
    FRAMES.lock().free(addr)
}

pub fn alloc_page() -> Result<VirtAddr, VmError> {
    with_vmm(|vm, frames| vm.alloc_page(frames))
}

pub fn alloc_pages(count: usize) -> Result<VirtAddr, VmError> {
    with_vmm(|vm, frames| vm.alloc_pages(count, frames))
}

pub fn free_page(ptr: VirtAddr) -> Result<(), VmError> {
    with_vmm(|vm, frames| vm.free_page(ptr, frames))
}

pub fn free_pages(ptr: VirtAddr, count: usize) -> Result<(), VmError> {
    with_vmm(|vm, frames| vm.free_pages(ptr, count, frames))
}

pub fn alloc_kstack() -> Result<VirtAddr, VmError> {
    with_vmm(|vm, frames| vm.alloc_kstack(frames))
}

/// A kernel stack with every page already backed.
pub fn alloc_thread_stack() -> Result<VirtAddr, VmError> {
    with_vmm(|vm, frames| vm.alloc_thread_stack(frames))
}

pub fn free_kstack(ptr: VirtAddr) -> Result<(), VmError> {
    with_vmm(|vm, frames| vm.free_kstack(ptr, frames))
}

pub fn kbrk(increment: isize) -> Result<VirtAddr, VmError> {
    with_vmm(|vm, frames| vm.kbrk(increment, frames))
}

/// Drops the backing of the whole pages in `[start, start + len)`.
pub fn decommit(start: usize, len: usize) -> usize {
    with_vmm(|vm, frames| Ok(vm.decommit_pages(VirtAddr::new(start as u64), len / PAGE_SIZE, frames)))
        .unwrap_or(0)
}

pub fn translate(addr: VirtAddr) -> Option<PhysAddr> {
    VMM.lock().as_ref()?.translate(addr)
}

pub fn page_faults() -> u64 {
    PAGE_FAULTS.load(Ordering::Relaxed)
}

/// Demand-paging entry point. Anything but a touch of a reserved page is
/// fatal.
fn page_fault_handler(_vector: u8, error_code: u64, frame: &mut TrapFrame, _context: usize) {
    PAGE_FAULTS.fetch_add(1, Ordering::Relaxed);
    let raw = arch::fault_address();
    let Ok(addr) = VirtAddr::try_new(raw) else {
        fatal!("page fault at non-canonical {:#x} (rip {:#x})", raw, frame.rip);
    };

    let Some(mut vmm) = VMM.try_lock() else {
        fatal!("page fault at {:#x} while the VMM was locked (rip {:#x})", raw, frame.rip);
    };
    let Some(vm) = vmm.as_mut() else {
        fatal!("page fault at {:#x} before paging was set up (rip {:#x})", raw, frame.rip);
    };
    let Some(mut frames) = FRAMES.try_lock() else {
        fatal!("page fault at {:#x} while frames were locked (rip {:#x})", raw, frame.rip);
    };

    if let Err(err) = vm.handle_page_fault(arch::page_table_base(), addr, &mut *frames) {
        fatal!("{} (rip {:#x}, error code {:#x})", err, frame.rip, error_code);
    }
}

/// Thread stacks from the global VMM. They are committed up front: a
/// thread may hold [`VMM`] or [`FRAMES`] and the fault handler cannot take
/// either then.
pub struct KernelStacks;

impl StackSource for KernelStacks {
    fn alloc_stack(&mut self) -> Result<VirtAddr, VmError> {
        alloc_thread_stack()
    }

    fn free_stack(&mut self, ptr: VirtAddr) -> Result<(), VmError> {
        free_kstack(ptr)
    }

    fn write_u64(&mut self, addr: VirtAddr, value: u64) -> Result<(), VmError> {
        with_vmm(|vm, frames| vm.write_u64(addr, value, frames))
    }
}
