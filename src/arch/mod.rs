//! The narrow architecture interface everything else is written against.
//!
//! On the kernel target these are the real x86_64 instructions. Unit tests
//! run on a development host where `cli`, `lidt` or `mov cr3` would fault, so
//! `cfg(test)` swaps in a per-thread simulation with the same surface.

pub mod trap;

#[cfg(not(test))]
mod cpu;
#[cfg(not(test))]
pub use cpu::*;

#[cfg(test)]
mod sim;
#[cfg(test)]
pub use sim::*;

pub use trap::TrapFrame;
