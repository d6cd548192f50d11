//! Host stand-ins for the CPU state the kernel touches.

use std::cell::Cell;

use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{PROC_EXIT_VECTOR, RFLAGS_IF, SYSCALL_VECTOR};

use super::TrapFrame;

thread_local! {
    static INTERRUPTS: Cell<bool> = const { Cell::new(true) };
    static CR2: Cell<u64> = const { Cell::new(0) };
    static CR3: Cell<u64> = const { Cell::new(0) };
    static TLB_FLUSHES: Cell<usize> = const { Cell::new(0) };
}

pub fn interrupts_enabled() -> bool {
    INTERRUPTS.with(|f| f.get())
}

pub fn disable_interrupts() {
    INTERRUPTS.with(|f| f.set(false));
}

pub fn enable_interrupts() {
    INTERRUPTS.with(|f| f.set(true));
}

pub fn fault_address() -> u64 {
    CR2.with(|r| r.get())
}

pub fn set_fault_address(addr: u64) {
    CR2.with(|r| r.set(addr));
}

pub fn page_table_base() -> PhysAddr {
    PhysAddr::new(CR3.with(|r| r.get()))
}

pub unsafe fn set_page_table_base(root: PhysAddr) {
    CR3.with(|r| r.set(root.as_u64()));
}

pub fn flush_tlb(_addr: VirtAddr) {
    TLB_FLUSHES.with(|c| c.set(c.get() + 1));
}

pub fn tlb_flushes() -> usize {
    TLB_FLUSHES.with(|c| c.get())
}

pub fn load_idt(_idt: &'static InterruptDescriptorTable) {}

/// Delivers a software interrupt the way the CPU would: IF cleared for the
/// duration of the handler, prior state restored on return.
fn deliver(vector: u8) -> TrapFrame {
    let was_enabled = interrupts_enabled();
    let mut frame = TrapFrame::new(vector, 0);
    if was_enabled {
        frame.rflags = RFLAGS_IF;
    }
    disable_interrupts();
    crate::interrupts::dispatch(&mut frame);
    if was_enabled {
        enable_interrupts();
    }
    frame
}

/// Runs the syscall vector and returns the `rax` it resumes with.
pub fn raise_syscall() -> u64 {
    deliver(SYSCALL_VECTOR).rax
}

pub fn raise_exit() {
    deliver(PROC_EXIT_VECTOR);
}

pub fn halt_loop() -> ! {
    panic!("kernel halted");
}

/// Register-level model of the two cascaded 8259 controllers.
#[derive(Debug)]
pub struct PicChips {
    pub offsets: [u8; 2],
    pub masks: [u8; 2],
    pub eoi_sent: [usize; 2],
    pub initialized: usize,
}

impl PicChips {
    pub const unsafe fn new(offset1: u8, offset2: u8) -> Self {
        Self {
            offsets: [offset1, offset2],
            masks: [0, 0],
            eoi_sent: [0, 0],
            initialized: 0,
        }
    }

    pub unsafe fn initialize(&mut self) {
        self.initialized += 1;
    }

    pub unsafe fn read_masks(&mut self) -> [u8; 2] {
        self.masks
    }

    pub unsafe fn write_masks(&mut self, mask1: u8, mask2: u8) {
        self.masks = [mask1, mask2];
    }

    pub fn handles_interrupt(&self, interrupt_id: u8) -> bool {
        self.offsets
            .iter()
            .any(|&o| o <= interrupt_id && interrupt_id < o.wrapping_add(8))
    }

    pub unsafe fn notify_end_of_interrupt(&mut self, interrupt_id: u8) {
        if !self.handles_interrupt(interrupt_id) {
            return;
        }
        let slave = self.offsets[1];
        if slave <= interrupt_id && interrupt_id < slave + 8 {
            self.eoi_sent[1] += 1;
        }
        self.eoi_sent[0] += 1;
    }
}
