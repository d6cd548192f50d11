//! System call numbers
use crate::config::{BLOCK_SYSCALL, YIELD_SYSCALL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SyscallNumber {
    // Scheduling
    Yield = YIELD_SYSCALL,
    Block = BLOCK_SYSCALL,

    // Unknown
    Unknown = usize::MAX,
}

impl From<usize> for SyscallNumber {
    fn from(num: usize) -> Self {
        match num {
            YIELD_SYSCALL => Self::Yield,
            BLOCK_SYSCALL => Self::Block,
            _ => Self::Unknown,
        }
    }
}

impl SyscallNumber {
    pub fn name(self) -> &'static str {
        match self {
            Self::Yield => "yield",
            Self::Block => "block_on",
            Self::Unknown => "unknown",
        }
    }
}
