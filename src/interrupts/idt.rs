//! # Interrupt Descriptor Table
//!
//! ## Gate layout
//!
//! Every vector the architecture does not reserve gets an interrupt gate
//! (IF cleared on entry) pointing at its entry stub in `arch::trap`. Vectors
//! whose handlers must survive a broken kernel stack switch to a dedicated
//! IST stack:
//!
//! | Vector | Exception / purpose   | IST slot |
//! |--------|-----------------------|----------|
//! | 0x08   | Double fault          | 1        |
//! | 0x0D   | General protection    | 2        |
//! | 0x0E   | Page fault            | 3        |
//! | 0x83   | Kernel thread exit    | 4        |
//! | others |                       | 0        |
//!
//! The Rust-side handler table is kept apart from the hardware table, so
//! registering a handler never touches a loaded descriptor.

use core::fmt;

use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::idt::{Entry, InterruptDescriptorTable};
use x86_64::VirtAddr;

use crate::arch::trap::STUB_STRIDE;
use crate::arch::TrapFrame;
use crate::config::{
    DOUBLE_FAULT_VECTOR, GENERAL_PROTECTION_VECTOR, IST_DOUBLE_FAULT, IST_GENERAL_PROTECTION,
    IST_PAGE_FAULT, IST_PROC_EXIT, PAGE_FAULT_VECTOR, PROC_EXIT_VECTOR,
};

pub const IDT_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptError {
    InvalidVector(usize),
    InvalidLine(u8),
}

impl fmt::Display for InterruptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterruptError::InvalidVector(v) => write!(f, "invalid interrupt vector {}", v),
            InterruptError::InvalidLine(l) => write!(f, "invalid IRQ line {}", l),
        }
    }
}

/// IST slot for `vector`, 0 for "stay on the current stack".
pub const fn ist_for(vector: u8) -> u8 {
    match vector {
        DOUBLE_FAULT_VECTOR => IST_DOUBLE_FAULT,
        GENERAL_PROTECTION_VECTOR => IST_GENERAL_PROTECTION,
        PAGE_FAULT_VECTOR => IST_PAGE_FAULT,
        PROC_EXIT_VECTOR => IST_PROC_EXIT,
        _ => 0,
    }
}

/// Vectors the architecture reserves. Their gates stay non-present.
pub const fn is_reserved(vector: u8) -> bool {
    matches!(vector, 15 | 22..=27 | 31)
}

pub fn stub_address(stub_base: u64, vector: u8) -> VirtAddr {
    VirtAddr::new(stub_base + u64::from(vector) * STUB_STRIDE)
}

/// Points `entry` at a raw entry stub. The stub, not a Rust function, is
/// what the CPU enters, so the entry's handler type is irrelevant here.
unsafe fn install<F>(entry: &mut Entry<F>, stub: VirtAddr, code: SegmentSelector, ist: u8) {
    let options = entry.set_handler_addr(stub);
    options.set_code_selector(code);
    if ist != 0 {
        // The crate counts IST slots from zero.
        options.set_stack_index(u16::from(ist - 1));
    }
}

/// Builds the IDT: one interrupt gate per non-reserved vector, targeting
/// `stub_base + vector * STUB_STRIDE`, with the IST slots of [`ist_for`].
pub fn build_idt(stub_base: u64, code: SegmentSelector) -> InterruptDescriptorTable {
    let mut idt = InterruptDescriptorTable::new();
    for vector in 0..=u8::MAX {
        let stub = stub_address(stub_base, vector);
        let ist = ist_for(vector);
        unsafe {
            match vector {
                v if is_reserved(v) => {}
                8 => install(&mut idt.double_fault, stub, code, ist),
                10 => install(&mut idt.invalid_tss, stub, code, ist),
                11 => install(&mut idt.segment_not_present, stub, code, ist),
                12 => install(&mut idt.stack_segment_fault, stub, code, ist),
                13 => install(&mut idt.general_protection_fault, stub, code, ist),
                14 => install(&mut idt.page_fault, stub, code, ist),
                17 => install(&mut idt.alignment_check, stub, code, ist),
                18 => install(&mut idt.machine_check, stub, code, ist),
                21 => install(&mut idt.cp_protection_exception, stub, code, ist),
                29 => install(&mut idt.vmm_communication_exception, stub, code, ist),
                30 => install(&mut idt.security_exception, stub, code, ist),
                _ => install(&mut idt[vector], stub, code, ist),
            }
        }
    }
    idt
}

pub type InterruptHandler = fn(vector: u8, error_code: u64, frame: &mut TrapFrame, context: usize);

#[derive(Clone, Copy)]
struct HandlerSlot {
    handler: InterruptHandler,
    context: usize,
}

/// Rust handlers and their opaque context words, one slot per vector.
pub struct HandlerTable {
    slots: [HandlerSlot; IDT_ENTRIES],
    default: InterruptHandler,
}

impl HandlerTable {
    pub const fn new(default: InterruptHandler) -> Self {
        Self {
            slots: [HandlerSlot { handler: default, context: 0 }; IDT_ENTRIES],
            default,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.default);
    }

    /// Overwrites the slot for `vector`.
    pub fn set(&mut self, vector: usize, handler: InterruptHandler, context: usize) -> Result<(), InterruptError> {
        let slot = self
            .slots
            .get_mut(vector)
            .ok_or(InterruptError::InvalidVector(vector))?;
        *slot = HandlerSlot { handler, context };
        Ok(())
    }

    pub fn get(&self, vector: u8) -> (InterruptHandler, usize) {
        let slot = self.slots[usize::from(vector)];
        (slot.handler, slot.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUBS: u64 = 0xFFFF_8000_0010_0000;

    fn ignore(_vector: u8, _error_code: u64, _frame: &mut TrapFrame, _context: usize) {}

    fn record(vector: u8, error_code: u64, frame: &mut TrapFrame, context: usize) {
        frame.rax = u64::from(vector);
        frame.rbx = error_code;
        frame.rcx = context as u64;
    }

    fn is_ignore(table: &HandlerTable, vector: u8) -> bool {
        table.get(vector).0 as usize == ignore as usize
    }

    /// Debug rendering of the gate for `vector`.
    fn gate(idt: &InterruptDescriptorTable, vector: u8) -> String {
        match vector {
            8 => format!("{:?}", idt.double_fault),
            10 => format!("{:?}", idt.invalid_tss),
            11 => format!("{:?}", idt.segment_not_present),
            12 => format!("{:?}", idt.stack_segment_fault),
            13 => format!("{:?}", idt.general_protection_fault),
            14 => format!("{:?}", idt.page_fault),
            17 => format!("{:?}", idt.alignment_check),
            18 => format!("{:?}", idt.machine_check),
            21 => format!("{:?}", idt.cp_protection_exception),
            29 => format!("{:?}", idt.vmm_communication_exception),
            30 => format!("{:?}", idt.security_exception),
            v => format!("{:?}", idt[v]),
        }
    }

    #[test]
    fn test_every_usable_vector_targets_its_stub() {
        let idt = build_idt(STUBS, SegmentSelector(0x08));
        for vector in (0..=255u8).filter(|&v| !is_reserved(v)) {
            let expected = format!("handler_addr: {:#x},", stub_address(STUBS, vector).as_u64());
            let rendered = gate(&idt, vector);
            assert!(rendered.contains(&expected), "vector {}: {}", vector, rendered);
            assert!(rendered.contains("present: true"), "vector {}: {}", vector, rendered);
        }
        assert_eq!(idt[0x80].handler_addr(), stub_address(STUBS, 0x80));
        assert_eq!(idt.page_fault.handler_addr(), stub_address(STUBS, 14));
    }

    #[test]
    fn test_gates_use_the_kernel_code_selector() {
        let idt = build_idt(STUBS, SegmentSelector(0x28));
        let rendered = gate(&idt, 0x20);
        assert!(rendered.contains(&format!("{:?}", SegmentSelector(0x28))), "{}", rendered);
    }

    #[test]
    fn test_critical_vectors_have_distinct_ist_slots() {
        let idt = build_idt(STUBS, SegmentSelector(0x08));
        let critical = [DOUBLE_FAULT_VECTOR, GENERAL_PROTECTION_VECTOR, PAGE_FAULT_VECTOR, PROC_EXIT_VECTOR];
        for vector in critical {
            // Hardware slots are 1-based, the crate reports them 0-based.
            let expected = format!("stack_index: Some({})", ist_for(vector) - 1);
            assert!(gate(&idt, vector).contains(&expected), "vector {:#x}", vector);
        }
        let mut slots: Vec<u8> = critical.iter().map(|&v| ist_for(v)).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), critical.len());

        for vector in (0..=255u8).filter(|v| !critical.contains(v) && !is_reserved(*v)) {
            assert!(gate(&idt, vector).contains("stack_index: None"), "vector {:#x}", vector);
        }
    }

    #[test]
    fn test_handler_table_rejects_out_of_range() {
        let mut table = HandlerTable::new(ignore);
        assert_eq!(table.set(256, record, 0), Err(InterruptError::InvalidVector(256)));
        assert!(is_ignore(&table, 255));
        assert_eq!(table.set(255, record, 9), Ok(()));
        assert!(!is_ignore(&table, 255));
    }

    #[test]
    fn test_reregistration_overwrites_and_reset_restores() {
        let mut table = HandlerTable::new(ignore);
        table.set(7, ignore, 1).unwrap();
        table.set(7, record, 2).unwrap();

        let (handler, context) = table.get(7);
        let mut frame = TrapFrame::new(7, 0);
        handler(7, 0x55, &mut frame, context);
        assert_eq!((frame.rax, frame.rbx, frame.rcx), (7, 0x55, 2));

        table.reset();
        assert!(is_ignore(&table, 7));
        assert_eq!(table.get(7).1, 0);
    }
}
