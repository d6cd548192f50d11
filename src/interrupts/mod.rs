//! # Interrupt dispatch
//!
//! Every vector enters through its stub in `arch::trap`, lands in
//! [`dispatch`] with a mutable [`TrapFrame`], and is forwarded to whatever
//! handler is registered for it. Unregistered vectors are counted and
//! reported, never fatal.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::idt::InterruptDescriptorTable;

use crate::arch::{self, TrapFrame};
use crate::serial_println;
use crate::sync::IrqMutex;

#[cfg(not(test))]
pub mod gdt;
pub mod idt;
pub mod pic;

pub use idt::{InterruptError, InterruptHandler};

static IDT: Once<InterruptDescriptorTable> = Once::new();
static HANDLERS: IrqMutex<idt::HandlerTable> = IrqMutex::new(idt::HandlerTable::new(unhandled));
static UNHANDLED: AtomicU64 = AtomicU64::new(0);

/// Kernel code and data selectors, as loaded into CS and SS.
#[cfg(not(test))]
pub fn kernel_selectors() -> (u16, u16) {
    let selectors = gdt::selectors();
    (selectors.code_selector.0, selectors.data_selector.0)
}

#[cfg(test)]
pub fn kernel_selectors() -> (u16, u16) {
    (0x08, 0x10)
}

/// Loads GDT/TSS, builds and loads the IDT, resets every handler slot and
/// remaps the PIC with all lines masked. Interrupts stay disabled.
pub fn init() -> Result<(), &'static str> {
    #[cfg(not(test))]
    gdt::init();

    let (code, _) = kernel_selectors();
    let table = IDT.call_once(|| idt::build_idt(arch::trap::stub_base(), SegmentSelector(code)));
    HANDLERS.lock().reset();
    arch::load_idt(table);
    serial_println!("[idt] {} gates loaded", idt::IDT_ENTRIES);

    pic::init();
    Ok(())
}

/// Registers `handler` for `vector`, replacing any earlier registration.
pub fn set_handler(vector: usize, handler: InterruptHandler, context: usize) -> Result<(), InterruptError> {
    HANDLERS.lock().set(vector, handler, context).inspect_err(|err| {
        serial_println!("[idt] set_handler: {}", err);
    })
}

/// Called by the trap path for every interrupt and exception.
pub fn dispatch(frame: &mut TrapFrame) {
    let Ok(vector) = u8::try_from(frame.vector) else {
        serial_println!("[idt] trap frame with vector {:#x}", frame.vector);
        return;
    };
    // Copy the slot out so the handler runs without the table locked.
    let (handler, context) = HANDLERS.lock().get(vector);
    handler(vector, frame.error_code, frame, context);
}

/// Acknowledges a PIC-sourced vector. Other vectors are ignored.
pub fn end_of_interrupt(vector: u8) {
    let mut pic = pic::PIC.lock();
    if let Some(line) = pic.line_for_vector(vector) {
        let _ = pic.send_eoi(line);
    }
}

pub fn unhandled_count() -> u64 {
    UNHANDLED.load(Ordering::Relaxed)
}

fn unhandled(vector: u8, error_code: u64, frame: &mut TrapFrame, _context: usize) {
    UNHANDLED.fetch_add(1, Ordering::Relaxed);
    serial_println!(
        "[idt] unhandled interrupt {:#x} (error code {:#x}, rip {:#x})",
        vector,
        error_code,
        frame.rip
    );
    end_of_interrupt(vector);
}
