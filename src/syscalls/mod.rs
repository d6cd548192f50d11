//! # System call gate
//!
//! Kernel threads call into the kernel through `int 0x80`. The number and
//! up to three arguments are parked in the gate before the trap and picked
//! up by the vector 0x80 handler, which runs the registered handler with
//! the caller's trap frame.

pub mod dispatcher;
pub mod numbers;

pub use dispatcher::{SyscallContext, SyscallError, SyscallGate, SyscallHandler, STATUS_OK, STATUS_UNREGISTERED};
pub use numbers::SyscallNumber;

use crate::arch::{self, TrapFrame};
use crate::config::{NUM_SYSCALLS, SYSCALL_VECTOR};
use crate::serial_println;
use crate::sync::{InterruptGuard, IrqMutex};

static GATE: IrqMutex<SyscallGate> = IrqMutex::new(SyscallGate::new());

/// Routes the syscall vector to the gate.
pub fn init() -> Result<(), &'static str> {
    crate::interrupts::set_handler(usize::from(SYSCALL_VECTOR), syscall_isr, 0)
        .map_err(|_| "syscall vector rejected")?;
    serial_println!("[syscall] gate on vector {:#x}, {} numbers", SYSCALL_VECTOR, NUM_SYSCALLS);
    Ok(())
}

pub fn register_syscall(num: usize, handler: SyscallHandler, context: usize) -> Result<(), SyscallError> {
    GATE.lock().register(num, handler, context)
}

/// Parks the call and traps into the gate. Returns once the handler (and
/// whatever it switched to) hands control back to this thread, with the
/// status the handler reported.
pub fn generic_syscall(num: usize, args: [usize; 3]) -> Result<(), SyscallError> {
    if num >= NUM_SYSCALLS {
        return Err(SyscallError::InvalidNumber(num));
    }
    // Nothing may run between parking the call and the trap.
    let _guard = InterruptGuard::new();
    GATE.lock().set_pending(SyscallContext { syscall_num: num, args });
    SyscallError::check(num, arch::raise_syscall())
}

fn syscall_isr(_vector: u8, _error_code: u64, frame: &mut TrapFrame, _context: usize) {
    let Some((call, entry)) = GATE.lock().take_pending() else {
        serial_println!("[syscall] trap without a pending call (rip {:#x})", frame.rip);
        frame.rax = STATUS_UNREGISTERED;
        return;
    };
    match entry {
        Ok(entry) => {
            frame.rax = STATUS_OK;
            (entry.handler)(frame, call.args, entry.context);
        }
        Err(err) => {
            serial_println!("[syscall] {} ({})", err, SyscallNumber::from(call.syscall_num).name());
            frame.rax = STATUS_UNREGISTERED;
        }
    }
}
