//! # nucleus
//!
//! A small x86_64 kernel core: interrupt descriptor table and PIC, physical
//! frames, a four-level address space with demand paging, a kernel heap, a
//! cooperative scheduler for kernel threads and a software-interrupt syscall
//! gate tying the last one together.
//!
//! Bring-up order lives in [`kernel::init_kernel`]. Under `cfg(test)` the
//! privileged instructions are simulated by [`arch`] so everything above it
//! runs as ordinary host unit tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod config;
pub mod interrupts;
pub mod kernel;
pub mod memory;
pub mod process;
pub mod serial;
pub mod sync;
pub mod syscalls;
#[cfg(all(feature = "boot-selftest", not(test)))]
pub mod test_env;
