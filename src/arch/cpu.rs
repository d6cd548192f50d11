use core::arch::asm;

use x86_64::instructions::{self, interrupts, tlb};
use x86_64::registers::control::{Cr2, Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{PROC_EXIT_VECTOR, SYSCALL_VECTOR};

/// The two cascaded 8259 controllers.
pub type PicChips = pic8259::ChainedPics;

// The `int` immediates below are spelled out.
const _: () = assert!(SYSCALL_VECTOR == 0x80 && PROC_EXIT_VECTOR == 0x83);

#[inline]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

#[inline]
pub fn disable_interrupts() {
    interrupts::disable();
}

#[inline]
pub fn enable_interrupts() {
    interrupts::enable();
}

/// Faulting linear address of the last page fault (CR2).
#[inline]
pub fn fault_address() -> u64 {
    Cr2::read_raw()
}

/// Physical address of the active top-level page table (CR3).
#[inline]
pub fn page_table_base() -> PhysAddr {
    Cr3::read().0.start_address()
}

/// # Safety
/// `root` must be a complete top-level table that maps the running code,
/// its stack and every structure the kernel touches next.
pub unsafe fn set_page_table_base(root: PhysAddr) {
    Cr3::write(PhysFrame::containing_address(root), Cr3Flags::empty());
}

#[inline]
pub fn flush_tlb(addr: VirtAddr) {
    tlb::flush(addr);
}

pub fn load_idt(idt: &'static InterruptDescriptorTable) {
    idt.load();
}

/// Trap into the syscall gate and return the status the handler left in
/// `rax`.
///
/// Not `nomem`: another thread may run and write memory before this returns.
#[inline]
pub fn raise_syscall() -> u64 {
    let status: u64;
    unsafe { asm!("int 0x80", lateout("rax") status) };
    status
}

/// Trap into the process-exit handler.
#[inline]
pub fn raise_exit() {
    unsafe { asm!("int 0x83") };
}

/// Stop the machine for good.
pub fn halt_loop() -> ! {
    loop {
        interrupts::disable();
        instructions::hlt();
    }
}
