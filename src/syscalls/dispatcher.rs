use core::fmt;

use crate::arch::TrapFrame;
use crate::config::NUM_SYSCALLS;

/// Status word a handler leaves in `rax` when the call worked.
pub const STATUS_OK: u64 = 0;

/// Status word the gate leaves in `rax` for a number nobody registered.
pub const STATUS_UNREGISTERED: u64 = u64::MAX;

/// System call errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidNumber(usize),
    /// The handler ran and reported this nonzero status.
    Failed(u64),
}

impl SyscallError {
    /// Reads the status word a finished call left in `rax`.
    pub fn check(num: usize, status: u64) -> Result<(), SyscallError> {
        match status {
            STATUS_OK => Ok(()),
            STATUS_UNREGISTERED => Err(Self::InvalidNumber(num)),
            other => Err(Self::Failed(other)),
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidNumber(num) => write!(f, "invalid syscall number {:#x}", num),
            Self::Failed(status) => write!(f, "syscall failed with status {}", status),
        }
    }
}

/// Handler for one syscall number. Runs inside the syscall interrupt with the
/// caller's trap frame, which it may rewrite (that is how `yield` switches).
/// `rax` holds [`STATUS_OK`] on entry; a failing handler stores its own
/// status there.
pub type SyscallHandler = fn(frame: &mut TrapFrame, args: [usize; 3], context: usize);

/// The call being made, parked until the software interrupt picks it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallContext {
    pub syscall_num: usize,
    pub args: [usize; 3],
}

#[derive(Clone, Copy)]
pub struct SyscallEntry {
    pub handler: SyscallHandler,
    pub context: usize,
}

/// Number -> handler table plus the single in-flight call slot.
pub struct SyscallGate {
    table: [Option<SyscallEntry>; NUM_SYSCALLS],
    pending: Option<SyscallContext>,
}

impl SyscallGate {
    pub const fn new() -> Self {
        Self {
            table: [None; NUM_SYSCALLS],
            pending: None,
        }
    }

    pub fn register(&mut self, num: usize, handler: SyscallHandler, context: usize) -> Result<(), SyscallError> {
        let slot = self.table.get_mut(num).ok_or(SyscallError::InvalidNumber(num))?;
        *slot = Some(SyscallEntry { handler, context });
        Ok(())
    }

    pub fn entry(&self, num: usize) -> Option<SyscallEntry> {
        self.table.get(num).copied().flatten()
    }

    pub fn set_pending(&mut self, call: SyscallContext) {
        self.pending = Some(call);
    }

    /// Takes the parked call and resolves its handler.
    pub fn take_pending(&mut self) -> Option<(SyscallContext, Result<SyscallEntry, SyscallError>)> {
        let call = self.pending.take()?;
        let entry = self
            .entry(call.syscall_num)
            .ok_or(SyscallError::InvalidNumber(call.syscall_num));
        Some((call, entry))
    }
}

impl Default for SyscallGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_args(frame: &mut TrapFrame, args: [usize; 3], context: usize) {
        frame.rax = (args.iter().sum::<usize>() + context) as u64;
    }

    #[test]
    fn test_register_rejects_out_of_table() {
        let mut gate = SyscallGate::new();
        assert_eq!(gate.register(NUM_SYSCALLS, sum_args, 0).unwrap_err(), SyscallError::InvalidNumber(256));
        assert!(gate.register(NUM_SYSCALLS - 1, sum_args, 0).is_ok());
    }

    #[test]
    fn test_status_word_decoding() {
        assert_eq!(SyscallError::check(7, STATUS_OK), Ok(()));
        assert_eq!(SyscallError::check(7, STATUS_UNREGISTERED), Err(SyscallError::InvalidNumber(7)));
        assert_eq!(SyscallError::check(7, 2), Err(SyscallError::Failed(2)));
    }

    #[test]
    fn test_pending_call_is_taken_once() {
        let mut gate = SyscallGate::new();
        gate.register(9, sum_args, 100).unwrap();
        gate.set_pending(SyscallContext { syscall_num: 9, args: [1, 2, 3] });

        let (call, entry) = gate.take_pending().unwrap();
        let entry = entry.ok().unwrap();
        let mut frame = TrapFrame::new(0x80, 0);
        (entry.handler)(&mut frame, call.args, entry.context);
        assert_eq!(frame.rax, 106);

        assert!(gate.take_pending().is_none());
    }

    #[test]
    fn test_unregistered_number_resolves_to_error() {
        let mut gate = SyscallGate::new();
        gate.set_pending(SyscallContext { syscall_num: 4, args: [0; 3] });
        let (_, entry) = gate.take_pending().unwrap();
        assert!(matches!(entry, Err(SyscallError::InvalidNumber(4))));
    }
}
